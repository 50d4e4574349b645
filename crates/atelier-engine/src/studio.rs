use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use atelier_contracts::cost::calculate_api_cost;
use atelier_contracts::history::{HistoryEntry, HistoryImage, HistoryStore};
use atelier_contracts::request::{EditForm, ImageRequest, SourceImage, MAX_EDIT_IMAGES};
use atelier_contracts::storage::{
    DirBlobStore, ImageRecord, KeyValueStore, LocalBlobStore, StorageMode,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::api::{ApiImage, ImageApi};
use crate::download::{DownloadableImage, Downloader};
use crate::object_urls::ObjectUrlRegistry;
use crate::resolver::{image_locator, ImageResolver, ImageSource};

const LOCAL_STORAGE_FILE: &str = "local_storage.json";
const IMAGE_STORE_DIR: &str = "images";
const PARTIAL_HISTORY_WARNING: &str = "Some images from this history entry could not be loaded (they might have been cleared from the local database).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    InFlight,
}

/// An image ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pub filename: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReport {
    pub entry: HistoryEntry,
    pub images: Vec<DisplayImage>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub images: Vec<DisplayImage>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhaseWatch {
    in_flight: Arc<AtomicBool>,
}

impl PhaseWatch {
    pub fn phase(&self) -> RequestPhase {
        if self.in_flight.load(Ordering::Acquire) {
            RequestPhase::InFlight
        } else {
            RequestPhase::Idle
        }
    }
}

/// Marks the request in flight and resets the phase to idle however the
/// request settles.
struct InFlightGuard {
    in_flight: Arc<AtomicBool>,
}

impl InFlightGuard {
    fn enter(in_flight: &Arc<AtomicBool>) -> Self {
        in_flight.store(true, Ordering::Release);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Optional byte limits for the on-disk stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageQuotas {
    /// Total size of stored image blobs.
    pub blob_bytes: Option<u64>,
    /// Size of the key/value file holding history metadata.
    pub history_bytes: Option<u64>,
}

/// Drives generate/edit requests and owns history, local images and handles.
pub struct Studio<A: ImageApi> {
    mode: StorageMode,
    api: A,
    store: Option<Arc<dyn LocalBlobStore>>,
    history: HistoryStore,
    resolver: ImageResolver,
    in_flight: Arc<AtomicBool>,
    latest_batch: Option<Vec<DisplayImage>>,
    last_error: Option<String>,
    warnings: Vec<String>,
    edit_form: EditForm,
}

impl<A: ImageApi> Studio<A> {
    /// Opens the on-disk stores under `data_dir`.
    pub fn open(mode: StorageMode, data_dir: &Path, api: A, quotas: StorageQuotas) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed creating {}", data_dir.display()))?;
        let kv = KeyValueStore::new(data_dir.join(LOCAL_STORAGE_FILE))
            .with_quota(quotas.history_bytes);
        let history = HistoryStore::load(kv);
        let store: Option<Arc<dyn LocalBlobStore>> = match mode {
            StorageMode::IndexedDb => Some(Arc::new(
                DirBlobStore::new(data_dir.join(IMAGE_STORE_DIR)).with_quota(quotas.blob_bytes),
            )),
            StorageMode::Fs => None,
        };
        Self::new(mode, api, history, store, ObjectUrlRegistry::new())
    }

    pub fn new(
        mode: StorageMode,
        api: A,
        history: HistoryStore,
        store: Option<Arc<dyn LocalBlobStore>>,
        urls: ObjectUrlRegistry,
    ) -> Result<Self> {
        if mode == StorageMode::IndexedDb && store.is_none() {
            bail!("indexeddb storage mode requires a local blob store");
        }
        let mut resolver = ImageResolver::new(mode, store.clone(), urls);
        resolver
            .refresh_snapshot()
            .context("failed reading local image store")?;
        info!(storage_mode = %mode, history_entries = history.len(), "studio ready");
        Ok(Self {
            mode,
            api,
            store,
            history,
            resolver,
            in_flight: Arc::new(AtomicBool::new(false)),
            latest_batch: None,
            last_error: None,
            warnings: Vec::new(),
            edit_form: EditForm::default(),
        })
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase_watch().phase()
    }

    /// A cheap handle for observing the request phase from elsewhere.
    pub fn phase_watch(&self) -> PhaseWatch {
        PhaseWatch {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.history.entries()
    }

    pub fn latest_batch(&self) -> Option<&[DisplayImage]> {
        self.latest_batch.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn resolver(&self) -> &ImageResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &ObjectUrlRegistry {
        self.resolver.cache().registry()
    }

    pub fn blob_store(&self) -> Option<&Arc<dyn LocalBlobStore>> {
        self.store.as_ref()
    }

    pub fn edit_form(&self) -> &EditForm {
        &self.edit_form
    }

    pub fn edit_form_mut(&mut self) -> &mut EditForm {
        &mut self.edit_form
    }

    pub fn get_image_source(&mut self, filename: &str) -> ImageSource {
        self.resolver.get_image_source(filename)
    }

    /// Submits whatever the edit form holds right now.
    pub fn submit_edit(&mut self) -> Result<SubmitReport> {
        let request = self.edit_form.to_request();
        self.submit(request)
    }

    /// Runs one request/response cycle and records the outcome.
    ///
    /// The previous batch and error are cleared first. Invalid requests are
    /// rejected before anything is sent. A failed request leaves history and
    /// stored images untouched.
    ///
    /// Taking `&mut self` means a second submit cannot start while one is in
    /// flight; [`PhaseWatch`] lets other threads observe the phase.
    pub fn submit(&mut self, request: ImageRequest) -> Result<SubmitReport> {
        self.last_error = None;
        self.warnings.clear();
        self.dismiss_batch();
        if let Err(err) = request.validate() {
            self.last_error = Some(err.to_string());
            return Err(err.into());
        }

        let _guard = InFlightGuard::enter(&self.in_flight);
        let started = Instant::now();
        info!(mode = %request.mode(), storage_mode = %self.mode, "sending image request");

        match self.run_request(&request, started) {
            Ok(report) => {
                self.warnings = report.warnings.clone();
                if let Some(last) = report.warnings.last() {
                    self.last_error = Some(last.clone());
                }
                self.latest_batch = Some(report.images.clone());
                Ok(report)
            }
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let chain = format!("{err:#}");
                error!(duration_ms, error = %chain, "image request failed");
                self.last_error = Some(err.to_string());
                self.latest_batch = None;
                Err(err)
            }
        }
    }

    fn run_request(&mut self, request: &ImageRequest, started: Instant) -> Result<SubmitReport> {
        let response = self.api.submit(request)?;
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(duration_ms, images = response.images.len(), "image request succeeded");

        let mut warnings = Vec::new();
        let images = self.persist_batch(&response.images, &mut warnings);

        let entry = HistoryEntry {
            timestamp: Utc::now().timestamp_millis(),
            images: images
                .iter()
                .map(|image| HistoryImage {
                    filename: image.filename.clone(),
                })
                .collect(),
            storage_mode_used: self.mode,
            duration_ms,
            quality: request.quality(),
            background: request.background(),
            moderation: request.moderation(),
            prompt: request.prompt().to_string(),
            mode: request.mode(),
            cost_details: calculate_api_cost(response.usage.as_ref()),
        };
        if let Err(err) = self.history.append(entry.clone()) {
            warnings.push(format!("Failed to save history: {err}"));
        }

        Ok(SubmitReport {
            entry,
            images,
            warnings,
        })
    }

    /// Routes returned images to their storage path. A failing image is
    /// dropped from the batch with a warning; the rest still land.
    fn persist_batch(
        &mut self,
        images: &[ApiImage],
        warnings: &mut Vec<String>,
    ) -> Vec<DisplayImage> {
        let mut out = Vec::with_capacity(images.len());
        match self.mode {
            StorageMode::Fs => {
                for image in images {
                    match image.path.as_ref() {
                        Some(path) => out.push(DisplayImage {
                            filename: image.filename.clone(),
                            source: ImageSource::Remote(path.clone()),
                        }),
                        None => warn!(filename = %image.filename, "image missing path in fs mode"),
                    }
                }
            }
            StorageMode::IndexedDb => {
                for image in images {
                    let Some(b64) = image.b64_json.as_ref() else {
                        warn!(
                            filename = %image.filename,
                            "image missing b64_json in indexeddb mode"
                        );
                        warnings.push(format!(
                            "Image {} was returned without image data.",
                            image.filename
                        ));
                        continue;
                    };
                    match self.store_image(&image.filename, b64) {
                        Ok(display) => out.push(display),
                        Err(err) => {
                            let chain = format!("{err:#}");
                            error!(
                                filename = %image.filename,
                                error = %chain,
                                "failed saving image locally"
                            );
                            warnings.push(format!(
                                "Failed to save image {} to local database.",
                                image.filename
                            ));
                        }
                    }
                }
                if let Err(err) = self.resolver.refresh_snapshot() {
                    warn!(error = %err, "failed refreshing local image snapshot");
                }
            }
        }
        out
    }

    fn store_image(&mut self, filename: &str, b64: &str) -> Result<DisplayImage> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| anyhow!("local blob store unavailable"))?;
        let bytes = BASE64
            .decode(b64.as_bytes())
            .context("image base64 decode failed")?;
        let record = ImageRecord::new(filename, bytes);
        store.put(record.clone())?;
        info!(filename, "saved image to local store");
        let handle = self.resolver.adopt(record);
        Ok(DisplayImage {
            filename: filename.to_string(),
            source: ImageSource::Handle(handle),
        })
    }

    /// Shows a past entry. Local images that no longer exist are left out
    /// and reported with a warning instead of failing the whole view.
    pub fn select_history(&mut self, timestamp: i64) -> Result<Selection> {
        let entry = self
            .history
            .find(timestamp)
            .cloned()
            .ok_or_else(|| anyhow!("No history entry with timestamp {timestamp}."))?;
        self.dismiss_batch();

        let mut images = Vec::with_capacity(entry.images.len());
        for filename in entry.filenames() {
            let resolution = self.resolver.resolve(filename);
            if resolution.degraded && entry.storage_mode_used == StorageMode::IndexedDb {
                warn!(filename, "history image could not be resolved");
                continue;
            }
            images.push(DisplayImage {
                filename: filename.to_string(),
                source: resolution.source,
            });
        }

        let warning =
            (images.len() != entry.images.len()).then(|| PARTIAL_HISTORY_WARNING.to_string());
        self.last_error = warning.clone();
        self.latest_batch = (!images.is_empty()).then(|| images.clone());
        Ok(Selection { images, warning })
    }

    /// Deletes all history; in local mode also every stored image and handle.
    pub fn clear_history(&mut self) -> Result<()> {
        self.dismiss_batch();
        self.last_error = None;
        self.warnings.clear();

        let result = self.clear_stores();
        if let Err(err) = &result {
            let chain = format!("{err:#}");
            error!(error = %chain, "failed clearing history");
            self.last_error = Some(format!("Failed to clear history: {err}"));
        }
        result
    }

    fn clear_stores(&mut self) -> Result<()> {
        self.history
            .replace_all(Vec::new())
            .context("history metadata could not be removed")?;
        info!("cleared history metadata");
        if self.mode == StorageMode::IndexedDb {
            let released = self.resolver.release_all();
            if let Some(store) = self.store.as_ref() {
                store.clear()?;
            }
            info!(released, "cleared local images");
        }
        Ok(())
    }

    /// Loads a stored image into the edit form as its only source image.
    pub fn send_to_edit(&mut self, filename: &str) -> Result<()> {
        self.last_error = None;
        if self.edit_form.contains(filename) {
            info!(filename, "image already in edit form");
            return Ok(());
        }
        if self.edit_form.is_full() {
            let message =
                format!("Cannot add more than {MAX_EDIT_IMAGES} images to the edit form.");
            self.last_error = Some(message.clone());
            bail!(message);
        }

        match self.fetch_image_bytes(filename) {
            Ok((bytes, mime_type)) => {
                self.edit_form
                    .replace_sources(SourceImage::new(filename, bytes, mime_type));
                info!(filename, "image sent to edit form");
                Ok(())
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Raw bytes and MIME type of a stored image.
    pub fn fetch_image_bytes(&self, filename: &str) -> Result<(Vec<u8>, String)> {
        const DEFAULT_MIME: &str = "image/png";
        match self.mode {
            StorageMode::IndexedDb => {
                let record = self
                    .resolver
                    .local_record(filename)?
                    .ok_or_else(|| anyhow!("Image {filename} not found in local database."))?;
                let mime_type = record.mime_type.unwrap_or_else(|| DEFAULT_MIME.to_string());
                Ok((record.bytes.to_vec(), mime_type))
            }
            StorageMode::Fs => {
                let fetched = self.api.fetch_image(&image_locator(filename))?;
                let mime_type = fetched.mime_type.unwrap_or_else(|| DEFAULT_MIME.to_string());
                Ok((fetched.bytes, mime_type))
            }
        }
    }

    /// Images of a history entry, with local bytes attached where available.
    pub fn prepare_download(&mut self, timestamp: i64) -> Result<Vec<DownloadableImage>> {
        let entry = self
            .history
            .find(timestamp)
            .cloned()
            .ok_or_else(|| anyhow!("No history entry with timestamp {timestamp}."))?;
        let mut prepared = Vec::with_capacity(entry.images.len());
        for filename in entry.filenames() {
            let bytes = match self.resolver.local_record(filename) {
                Ok(record) => record.map(|record| record.bytes),
                Err(err) => {
                    warn!(filename, error = %err, "failed reading local image for download");
                    None
                }
            };
            prepared.push(DownloadableImage {
                filename: filename.to_string(),
                path: self.resolver.get_image_source(filename).as_str().to_string(),
                bytes,
            });
        }
        Ok(prepared)
    }

    /// Writes every image of a history entry into `out_dir`.
    pub fn download_entry<F>(
        &mut self,
        timestamp: i64,
        out_dir: &Path,
        on_progress: F,
    ) -> Result<Vec<PathBuf>>
    where
        F: FnMut(usize, usize),
    {
        let images = self.prepare_download(timestamp)?;
        Downloader::new(self.resolver.cache().registry(), &self.api).download_many(
            &images,
            out_dir,
            on_progress,
        )
    }

    /// Ends the current view and revokes handles it was the last holder of.
    pub fn dismiss_batch(&mut self) {
        self.latest_batch = None;
        self.resolver.cache_mut().collect_retired();
    }
}
