use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::api::ImageApi;
use crate::object_urls::{is_blob_url, ObjectUrlRegistry};
use crate::resolver::is_image_locator;

/// An image to save: either inline bytes or a path to dereference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadableImage {
    pub filename: String,
    pub path: String,
    pub bytes: Option<Arc<[u8]>>,
}

/// Writes images to a directory, pulling bytes from blob handles or the server.
pub struct Downloader<'a> {
    urls: &'a ObjectUrlRegistry,
    api: &'a dyn ImageApi,
}

impl<'a> Downloader<'a> {
    pub fn new(urls: &'a ObjectUrlRegistry, api: &'a dyn ImageApi) -> Self {
        Self { urls, api }
    }

    pub fn download_single(&self, image: &DownloadableImage, out_dir: &Path) -> Result<PathBuf> {
        let bytes = self
            .image_bytes(image)?
            .with_context(|| format!("Invalid image path format: {}", image.path))?;
        write_download(out_dir, &image.filename, &bytes)
    }

    /// Saves each image in turn. Images with an unusable path are skipped.
    pub fn download_many<F>(
        &self,
        images: &[DownloadableImage],
        out_dir: &Path,
        mut on_progress: F,
    ) -> Result<Vec<PathBuf>>
    where
        F: FnMut(usize, usize),
    {
        let mut written = Vec::with_capacity(images.len());
        for (idx, image) in images.iter().enumerate() {
            match self.image_bytes(image)? {
                Some(bytes) => written.push(write_download(out_dir, &image.filename, &bytes)?),
                None => warn!(
                    filename = %image.filename,
                    path = %image.path,
                    "skipping invalid image"
                ),
            }
            on_progress(idx + 1, images.len());
        }
        info!(count = written.len(), out_dir = %out_dir.display(), "downloaded images");
        Ok(written)
    }

    fn image_bytes(&self, image: &DownloadableImage) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = image.bytes.as_ref() {
            return Ok(Some(bytes.to_vec()));
        }
        if is_blob_url(&image.path) {
            let Some((bytes, _)) = self.urls.fetch(&image.path) else {
                bail!("Blob handle for {} has already been released", image.filename);
            };
            return Ok(Some(bytes.to_vec()));
        }
        if is_image_locator(&image.path) {
            return Ok(Some(self.api.fetch_image(&image.path)?.bytes));
        }
        Ok(None)
    }
}

fn write_download(out_dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
    let name = Path::new(filename)
        .file_name()
        .with_context(|| format!("invalid download filename '{filename}'"))?;
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed creating {}", out_dir.display()))?;
    let target = out_dir.join(name);
    std::fs::write(&target, bytes)
        .with_context(|| format!("failed to write {}", target.display()))?;
    Ok(target)
}
