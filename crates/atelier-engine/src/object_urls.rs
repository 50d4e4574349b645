use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;
use uuid::Uuid;

const BLOB_URL_PREFIX: &str = "blob:atelier/";

/// A process-local `blob:` URL pointing at bytes held by an [`ObjectUrlRegistry`].
///
/// Clones share one allocation, so the number of live clones tells whether
/// any view still points at the handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobHandle(Arc<str>);

impl BlobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True while a clone of this handle exists outside the caller.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_blob_url(raw: &str) -> bool {
    raw.starts_with("blob:")
}

#[derive(Debug, Clone)]
struct ObjectEntry {
    bytes: Arc<[u8]>,
    mime_type: Option<String>,
}

/// Mints and revokes blob handles. Bytes stay reachable until revocation.
#[derive(Debug, Clone, Default)]
pub struct ObjectUrlRegistry {
    objects: Arc<Mutex<HashMap<String, ObjectEntry>>>,
}

impl ObjectUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, bytes: Arc<[u8]>, mime_type: Option<String>) -> BlobHandle {
        let url = format!("{BLOB_URL_PREFIX}{}", Uuid::new_v4());
        self.objects()
            .insert(url.clone(), ObjectEntry { bytes, mime_type });
        BlobHandle(url.into())
    }

    /// Releases the bytes behind `handle`. Returns false if it was already revoked.
    pub fn revoke(&self, handle: &BlobHandle) -> bool {
        if self.objects().remove(handle.as_str()).is_some() {
            return true;
        }
        warn!(handle = %handle, "blob handle revoked twice");
        false
    }

    pub fn fetch(&self, url: &str) -> Option<(Arc<[u8]>, Option<String>)> {
        self.objects()
            .get(url)
            .map(|entry| (Arc::clone(&entry.bytes), entry.mime_type.clone()))
    }

    pub fn is_live(&self, handle: &BlobHandle) -> bool {
        self.objects().contains_key(handle.as_str())
    }

    pub fn live_count(&self) -> usize {
        self.objects().len()
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, ObjectEntry>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
