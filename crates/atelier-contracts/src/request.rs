use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of source images one edit request may carry.
pub const MAX_EDIT_IMAGES: usize = 10;
/// Maximum number of images one request may ask for.
pub const MAX_IMAGES_PER_REQUEST: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Prompt cannot be empty.")]
    EmptyPrompt,

    #[error("Image count must be between 1 and 10, got {0}.")]
    InvalidCount(u8),

    #[error("Please select at least one image to edit.")]
    NoSourceImages,

    #[error("Cannot add more than {max} images to the edit form.")]
    TooManyImages { count: usize, max: usize },

    #[error("Output compression must be between 0 and 100, got {0}.")]
    CompressionOutOfRange(u8),
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub enum $name {
            #[default]
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw {
                    $($wire => Ok($name::$variant),)+
                    other => Err(format!(
                        "invalid {} '{}' (expected one of: {})",
                        stringify!($name),
                        other,
                        [$($wire),+].join(", ")
                    )),
                }
            }
        }
    };
}

wire_enum!(
    /// Whether a request creates new images or edits supplied ones.
    RequestMode { Generate => "generate", Edit => "edit" }
);
wire_enum!(ImageSize {
    Auto => "auto",
    Square => "1024x1024",
    Landscape => "1536x1024",
    Portrait => "1024x1536",
});
wire_enum!(Quality { Auto => "auto", Low => "low", Medium => "medium", High => "high" });
wire_enum!(OutputFormat { Png => "png", Jpeg => "jpeg", Webp => "webp" });
wire_enum!(Background { Auto => "auto", Opaque => "opaque", Transparent => "transparent" });
wire_enum!(Moderation { Auto => "auto", Low => "low" });

impl OutputFormat {
    /// Only lossy formats accept a compression level.
    pub fn supports_compression(self) -> bool {
        matches!(self, OutputFormat::Jpeg | OutputFormat::Webp)
    }
}

/// An image file attached to an edit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub file_name: String,
    pub bytes: Arc<[u8]>,
    pub mime_type: String,
}

impl SourceImage {
    pub fn new(
        file_name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub n: u8,
    pub size: ImageSize,
    pub quality: Quality,
    pub output_format: OutputFormat,
    pub output_compression: Option<u8>,
    pub background: Background,
    pub moderation: Moderation,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            n: 1,
            size: ImageSize::Auto,
            quality: Quality::Auto,
            output_format: OutputFormat::Png,
            output_compression: None,
            background: Background::Auto,
            moderation: Moderation::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub prompt: String,
    pub n: u8,
    pub size: ImageSize,
    pub quality: Quality,
    pub images: Vec<SourceImage>,
    pub mask: Option<SourceImage>,
}

/// The request shape differs per mode, so each mode gets its own variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRequest {
    Generate(GenerateRequest),
    Edit(EditRequest),
}

impl ImageRequest {
    pub fn mode(&self) -> RequestMode {
        match self {
            ImageRequest::Generate(_) => RequestMode::Generate,
            ImageRequest::Edit(_) => RequestMode::Edit,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            ImageRequest::Generate(request) => &request.prompt,
            ImageRequest::Edit(request) => &request.prompt,
        }
    }

    pub fn quality(&self) -> Quality {
        match self {
            ImageRequest::Generate(request) => request.quality,
            ImageRequest::Edit(request) => request.quality,
        }
    }

    /// Edits do not expose a background choice; history records `auto`.
    pub fn background(&self) -> Background {
        match self {
            ImageRequest::Generate(request) => request.background,
            ImageRequest::Edit(_) => Background::Auto,
        }
    }

    pub fn moderation(&self) -> Moderation {
        match self {
            ImageRequest::Generate(request) => request.moderation,
            ImageRequest::Edit(_) => Moderation::Auto,
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.prompt().trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        let n = match self {
            ImageRequest::Generate(request) => request.n,
            ImageRequest::Edit(request) => request.n,
        };
        if n == 0 || n > MAX_IMAGES_PER_REQUEST {
            return Err(RequestError::InvalidCount(n));
        }
        match self {
            ImageRequest::Generate(request) => {
                if let Some(level) = request.output_compression {
                    if level > 100 {
                        return Err(RequestError::CompressionOutOfRange(level));
                    }
                }
            }
            ImageRequest::Edit(request) => {
                if request.images.is_empty() {
                    return Err(RequestError::NoSourceImages);
                }
                if request.images.len() > MAX_EDIT_IMAGES {
                    return Err(RequestError::TooManyImages {
                        count: request.images.len(),
                        max: MAX_EDIT_IMAGES,
                    });
                }
            }
        }
        Ok(())
    }

    /// Text fields of the multipart body, in send order.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("mode", self.mode().as_str().to_string())];
        match self {
            ImageRequest::Generate(request) => {
                fields.push(("prompt", request.prompt.clone()));
                fields.push(("n", request.n.to_string()));
                fields.push(("size", request.size.as_str().to_string()));
                fields.push(("quality", request.quality.as_str().to_string()));
                fields.push(("output_format", request.output_format.as_str().to_string()));
                if request.output_format.supports_compression() {
                    if let Some(level) = request.output_compression {
                        fields.push(("output_compression", level.to_string()));
                    }
                }
                fields.push(("background", request.background.as_str().to_string()));
                fields.push(("moderation", request.moderation.as_str().to_string()));
            }
            ImageRequest::Edit(request) => {
                fields.push(("prompt", request.prompt.clone()));
                fields.push(("n", request.n.to_string()));
                fields.push(("size", request.size.as_str().to_string()));
                fields.push(("quality", request.quality.as_str().to_string()));
            }
        }
        fields
    }
}

/// Mutable edit form state. Submissions snapshot it with [`EditForm::to_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct EditForm {
    pub prompt: String,
    pub n: u8,
    pub size: ImageSize,
    pub quality: Quality,
    pub mask: Option<SourceImage>,
    images: Vec<SourceImage>,
}

impl Default for EditForm {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            n: 1,
            size: ImageSize::Auto,
            quality: Quality::Auto,
            mask: None,
            images: Vec::new(),
        }
    }
}

impl EditForm {
    pub fn images(&self) -> &[SourceImage] {
        &self.images
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.images.iter().any(|image| image.file_name == file_name)
    }

    pub fn is_full(&self) -> bool {
        self.images.len() >= MAX_EDIT_IMAGES
    }

    /// Appends one source image (the paste path), refusing once the form is full.
    pub fn add_source_image(&mut self, image: SourceImage) -> Result<(), RequestError> {
        if self.is_full() {
            return Err(RequestError::TooManyImages {
                count: self.images.len() + 1,
                max: MAX_EDIT_IMAGES,
            });
        }
        self.images.push(image);
        Ok(())
    }

    /// Makes `image` the only source image.
    pub fn replace_sources(&mut self, image: SourceImage) {
        self.images.clear();
        self.images.push(image);
    }

    pub fn to_request(&self) -> ImageRequest {
        ImageRequest::Edit(EditRequest {
            prompt: self.prompt.clone(),
            n: self.n,
            size: self.size,
            quality: self.quality,
            images: self.images.clone(),
            mask: self.mask.clone(),
        })
    }
}
