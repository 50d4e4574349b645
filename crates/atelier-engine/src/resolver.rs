use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use atelier_contracts::storage::{BlobStoreError, ImageRecord, LocalBlobStore, StorageMode};
use tracing::warn;

use crate::blob_cache::BlobUrlCache;
use crate::object_urls::{BlobHandle, ObjectUrlRegistry};

const IMAGE_LOCATOR_PREFIX: &str = "/api/image/";

/// Stable server path for an image filename.
pub fn image_locator(filename: &str) -> String {
    format!("{IMAGE_LOCATOR_PREFIX}{filename}")
}

pub fn is_image_locator(raw: &str) -> bool {
    raw.starts_with(IMAGE_LOCATOR_PREFIX)
}

/// Something the display layer can dereference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Handle(BlobHandle),
    Remote(String),
}

impl ImageSource {
    pub fn as_str(&self) -> &str {
        match self {
            ImageSource::Handle(handle) => handle.as_str(),
            ImageSource::Remote(locator) => locator,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ImageSource::Handle(_))
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one lookup. `degraded` marks a local-mode image that had to
/// fall back to the server locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub source: ImageSource,
    pub degraded: bool,
}

/// Turns filenames into image sources: blob cache, then the local store
/// snapshot, then the server locator.
pub struct ImageResolver {
    mode: StorageMode,
    store: Option<Arc<dyn LocalBlobStore>>,
    snapshot: HashMap<String, ImageRecord>,
    cache: BlobUrlCache,
}

impl ImageResolver {
    pub fn new(
        mode: StorageMode,
        store: Option<Arc<dyn LocalBlobStore>>,
        urls: ObjectUrlRegistry,
    ) -> Self {
        Self {
            mode,
            store,
            snapshot: HashMap::new(),
            cache: BlobUrlCache::new(urls),
        }
    }

    pub fn cache(&self) -> &BlobUrlCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BlobUrlCache {
        &mut self.cache
    }

    /// Reloads the local store snapshot with a single bulk read.
    pub fn refresh_snapshot(&mut self) -> Result<usize, BlobStoreError> {
        let Some(store) = self.store.as_ref().filter(|_| self.mode == StorageMode::IndexedDb)
        else {
            self.snapshot.clear();
            return Ok(0);
        };
        self.snapshot = store
            .get_all()?
            .into_iter()
            .map(|record| (record.filename.clone(), record))
            .collect();
        Ok(self.snapshot.len())
    }

    pub fn get_image_source(&mut self, filename: &str) -> ImageSource {
        self.resolve(filename).source
    }

    pub fn resolve(&mut self, filename: &str) -> Resolution {
        if self.mode == StorageMode::Fs {
            return Resolution {
                source: ImageSource::Remote(image_locator(filename)),
                degraded: false,
            };
        }

        let snapshot = &self.snapshot;
        if let Some(handle) = self
            .cache
            .resolve(filename, || snapshot.get(filename).cloned())
        {
            return Resolution {
                source: ImageSource::Handle(handle),
                degraded: false,
            };
        }

        warn!(filename, "image missing from local store; falling back to server path");
        Resolution {
            source: ImageSource::Remote(image_locator(filename)),
            degraded: true,
        }
    }

    /// Caches a handle for a record that was just written to the store.
    pub fn adopt(&mut self, record: ImageRecord) -> BlobHandle {
        self.snapshot.insert(record.filename.clone(), record.clone());
        self.cache.insert(record)
    }

    /// Local bytes for `filename`: snapshot first, then a direct store read.
    pub fn local_record(&self, filename: &str) -> Result<Option<ImageRecord>, BlobStoreError> {
        if let Some(record) = self.snapshot.get(filename) {
            return Ok(Some(record.clone()));
        }
        match self.store.as_ref() {
            Some(store) => store.get(filename),
            None => Ok(None),
        }
    }

    /// Revokes all handles and forgets the snapshot.
    pub fn release_all(&mut self) -> usize {
        self.snapshot.clear();
        self.cache.release_all()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atelier_contracts::storage::{ImageRecord, LocalBlobStore, MemoryBlobStore, StorageMode};

    use super::{image_locator, ImageResolver, ImageSource};
    use crate::object_urls::ObjectUrlRegistry;

    fn resolver_with(mode: StorageMode, filenames: &[&str]) -> anyhow::Result<ImageResolver> {
        let store = Arc::new(MemoryBlobStore::new());
        for filename in filenames {
            store.put(ImageRecord::new(*filename, b"bytes".to_vec()))?;
        }
        let store: Arc<dyn LocalBlobStore> = store;
        let mut resolver = ImageResolver::new(mode, Some(store), ObjectUrlRegistry::new());
        resolver.refresh_snapshot()?;
        Ok(resolver)
    }

    #[test]
    fn fs_mode_always_returns_the_locator() -> anyhow::Result<()> {
        let mut resolver = resolver_with(StorageMode::Fs, &["a.png"])?;
        assert_eq!(
            resolver.get_image_source("a.png"),
            ImageSource::Remote("/api/image/a.png".to_string())
        );
        assert_eq!(resolver.cache().live_len(), 0);
        Ok(())
    }

    #[test]
    fn local_image_resolves_to_a_cached_handle() -> anyhow::Result<()> {
        let mut resolver = resolver_with(StorageMode::IndexedDb, &["a.png"])?;
        let first = resolver.resolve("a.png");
        assert!(first.source.is_local());
        assert!(!first.degraded);
        assert_eq!(resolver.get_image_source("a.png"), first.source);
        assert_eq!(resolver.cache().registry().live_count(), 1);
        Ok(())
    }

    #[test]
    fn missing_local_image_falls_back_without_failing() -> anyhow::Result<()> {
        let mut resolver = resolver_with(StorageMode::IndexedDb, &[])?;
        let resolution = resolver.resolve("gone.png");
        assert!(resolution.degraded);
        assert_eq!(
            resolution.source,
            ImageSource::Remote(image_locator("gone.png"))
        );
        Ok(())
    }

    #[test]
    fn release_all_empties_cache_and_snapshot() -> anyhow::Result<()> {
        let mut resolver = resolver_with(StorageMode::IndexedDb, &["a.png", "b.png"])?;
        resolver.get_image_source("a.png");
        resolver.get_image_source("b.png");
        assert_eq!(resolver.release_all(), 2);
        assert_eq!(resolver.cache().live_len(), 0);
        assert!(resolver.resolve("a.png").degraded);
        Ok(())
    }
}
