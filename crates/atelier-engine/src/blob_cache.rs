use std::collections::HashMap;
use std::sync::Arc;

use atelier_contracts::storage::ImageRecord;
use tracing::debug;

use crate::object_urls::{BlobHandle, ObjectUrlRegistry};

#[derive(Debug)]
struct CacheEntry {
    handle: BlobHandle,
    created_from: Arc<[u8]>,
}

/// Filename to blob handle map with explicit release.
///
/// At most one live entry exists per filename. Released or superseded
/// handles are parked until no view holds a clone, then revoked by
/// [`BlobUrlCache::collect_retired`]. Dropping the cache revokes everything.
#[derive(Debug)]
pub struct BlobUrlCache {
    urls: ObjectUrlRegistry,
    entries: HashMap<String, CacheEntry>,
    retired: Vec<CacheEntry>,
}

impl BlobUrlCache {
    pub fn new(urls: ObjectUrlRegistry) -> Self {
        Self {
            urls,
            entries: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn registry(&self) -> &ObjectUrlRegistry {
        &self.urls
    }

    /// Returns the cached handle, or mints one from `bytes_provider` on a miss.
    pub fn resolve<F>(&mut self, filename: &str, bytes_provider: F) -> Option<BlobHandle>
    where
        F: FnOnce() -> Option<ImageRecord>,
    {
        if let Some(entry) = self.entries.get(filename) {
            return Some(entry.handle.clone());
        }
        let record = bytes_provider()?;
        debug!(filename, "creating blob handle from local store");
        Some(self.insert(record))
    }

    /// Caches a handle for freshly stored bytes, superseding any older entry.
    pub fn insert(&mut self, record: ImageRecord) -> BlobHandle {
        if let Some(existing) = self.entries.get(&record.filename) {
            if Arc::ptr_eq(&existing.created_from, &record.bytes) {
                return existing.handle.clone();
            }
        }
        let handle = self
            .urls
            .create(Arc::clone(&record.bytes), record.mime_type.clone());
        let entry = CacheEntry {
            handle: handle.clone(),
            created_from: record.bytes,
        };
        if let Some(previous) = self.entries.insert(record.filename, entry) {
            self.retired.push(previous);
            self.collect_retired();
        }
        handle
    }

    pub fn get(&self, filename: &str) -> Option<BlobHandle> {
        self.entries.get(filename).map(|entry| entry.handle.clone())
    }

    /// Drops the entry for `filename`; its handle is revoked once unreferenced.
    pub fn release(&mut self, filename: &str) -> bool {
        let Some(entry) = self.entries.remove(filename) else {
            return false;
        };
        self.retired.push(entry);
        self.collect_retired();
        true
    }

    /// Revokes parked handles that no view still holds. Returns how many.
    pub fn collect_retired(&mut self) -> usize {
        let urls = &self.urls;
        let before = self.retired.len();
        self.retired.retain(|entry| {
            if entry.handle.is_shared() {
                return true;
            }
            urls.revoke(&entry.handle);
            false
        });
        before - self.retired.len()
    }

    /// Revokes every cached and parked handle, then empties the cache.
    pub fn release_all(&mut self) -> usize {
        let mut revoked = 0;
        for entry in self.entries.values().chain(self.retired.iter()) {
            if self.urls.revoke(&entry.handle) {
                revoked += 1;
            }
        }
        self.entries.clear();
        self.retired.clear();
        if revoked > 0 {
            debug!(revoked, "released blob handles");
        }
        revoked
    }

    pub fn live_len(&self) -> usize {
        self.entries.len()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }
}

impl Drop for BlobUrlCache {
    fn drop(&mut self) {
        self.release_all();
    }
}
