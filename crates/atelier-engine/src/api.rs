use std::time::Duration;

use anyhow::{bail, Context, Result};
use atelier_contracts::request::{ImageRequest, SourceImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;

/// One image entry of a successful API response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiImage {
    pub filename: String,
    pub path: Option<String>,
    pub b64_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub images: Vec<ApiImage>,
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// The remote generation/editing service.
pub trait ImageApi: Send + Sync {
    fn submit(&self, request: &ImageRequest) -> Result<ApiResponse>;
    fn fetch_image(&self, locator: &str) -> Result<FetchedImage>;
}

pub struct HttpImageApi {
    api_base: String,
    http: HttpClient,
}

impl HttpImageApi {
    pub fn new(api_base: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = HttpClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http: builder.build().context("failed building HTTP client")?,
        })
    }

    fn build_form(request: &ImageRequest) -> Result<MultipartForm> {
        let mut form = MultipartForm::new();
        for (key, value) in request.form_fields() {
            form = form.text(key, value);
        }
        if let ImageRequest::Edit(edit) = request {
            for (idx, image) in edit.images.iter().enumerate() {
                form = form.part(format!("image_{idx}"), file_part(image)?);
            }
            if let Some(mask) = edit.mask.as_ref() {
                form = form.part("mask", file_part(mask)?);
            }
        }
        Ok(form)
    }
}

impl ImageApi for HttpImageApi {
    fn submit(&self, request: &ImageRequest) -> Result<ApiResponse> {
        let endpoint = format!("{}/api/images", self.api_base);
        debug!(endpoint = %endpoint, mode = %request.mode(), "posting image request");
        let response = self
            .http
            .post(&endpoint)
            .multipart(Self::build_form(request)?)
            .send()
            .with_context(|| format!("image request failed ({endpoint})"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .context("image API response body read failed")?;
        parse_api_response(status, &body)
    }

    fn fetch_image(&self, locator: &str) -> Result<FetchedImage> {
        let url = format!("{}{}", self.api_base, locator);
        let response = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("failed downloading image ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!(
                "Failed to fetch image: {}",
                status.canonical_reason().unwrap_or(status.as_str())
            );
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec();
        Ok(FetchedImage { bytes, mime_type })
    }
}

fn file_part(image: &SourceImage) -> Result<MultipartPart> {
    MultipartPart::bytes(image.bytes.to_vec())
        .file_name(image.file_name.clone())
        .mime_str(&image.mime_type)
        .with_context(|| format!("invalid mime '{}' for {}", image.mime_type, image.file_name))
}

/// Interprets an `/api/images` reply.
///
/// Non-2xx replies surface the payload's `error` string when present. A
/// successful reply without any named image is an error too.
pub fn parse_api_response(status: u16, body: &str) -> Result<ApiResponse> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let success = (200..300).contains(&status);
    if !success {
        let message = parsed
            .as_ref()
            .and_then(|payload| payload.get("error"))
            .and_then(Value::as_str)
            .filter(|message| !message.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("API request failed with status {status}"));
        bail!(message);
    }
    let Some(payload) = parsed else {
        bail!("API returned an invalid JSON payload");
    };

    let images: Vec<ApiImage> = payload
        .get("images")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(parse_image_row).collect())
        .unwrap_or_default();
    if images.is_empty() {
        bail!("API response did not contain valid image data or filenames.");
    }

    Ok(ApiResponse {
        images,
        usage: payload.get("usage").cloned().filter(|usage| !usage.is_null()),
    })
}

fn parse_image_row(row: &Value) -> Option<ApiImage> {
    let obj = row.as_object()?;
    let filename = obj
        .get("filename")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())?;
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    Some(ApiImage {
        filename: filename.to_string(),
        path: text("path"),
        b64_json: text("b64_json"),
    })
}
