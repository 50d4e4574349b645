use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("storage quota exceeded saving {filename} ({needed} bytes needed, quota {quota})")]
    QuotaExceeded {
        filename: String,
        needed: u64,
        quota: u64,
    },

    #[error("invalid image filename '{0}'")]
    InvalidFilename(String),

    #[error("blob index serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blob store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob store lock poisoned")]
    LockPoisoned,
}

/// Raw image bytes keyed by filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub filename: String,
    pub bytes: Arc<[u8]>,
    pub mime_type: Option<String>,
}

impl ImageRecord {
    /// Builds a record, sniffing the MIME type from the payload.
    pub fn new(filename: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let mime_type = image::guess_format(&bytes)
            .ok()
            .map(|format| format.to_mime_type().to_string());
        Self {
            filename: filename.into(),
            bytes,
            mime_type,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Client-side store for image bytes, only used in `indexeddb` mode.
///
/// Writes to the same filename are serialized; the last write wins.
pub trait LocalBlobStore: Send + Sync {
    fn put(&self, record: ImageRecord) -> Result<(), BlobStoreError>;
    fn get(&self, filename: &str) -> Result<Option<ImageRecord>, BlobStoreError>;
    fn get_all(&self) -> Result<Vec<ImageRecord>, BlobStoreError>;
    fn clear(&self) -> Result<(), BlobStoreError>;
    fn len(&self) -> Result<usize, BlobStoreError>;

    fn is_empty(&self) -> Result<bool, BlobStoreError> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    records: Mutex<HashMap<String, ImageRecord>>,
    quota_bytes: Option<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: Option<u64>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            quota_bytes,
        }
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, ImageRecord>>, BlobStoreError> {
        self.records.lock().map_err(|_| BlobStoreError::LockPoisoned)
    }
}

impl LocalBlobStore for MemoryBlobStore {
    fn put(&self, record: ImageRecord) -> Result<(), BlobStoreError> {
        validate_filename(&record.filename)?;
        let mut records = self.records()?;
        if let Some(quota) = self.quota_bytes {
            let used: u64 = records
                .values()
                .filter(|existing| existing.filename != record.filename)
                .map(ImageRecord::size)
                .sum();
            check_quota(&record, used, quota)?;
        }
        records.insert(record.filename.clone(), record);
        Ok(())
    }

    fn get(&self, filename: &str) -> Result<Option<ImageRecord>, BlobStoreError> {
        Ok(self.records()?.get(filename).cloned())
    }

    fn get_all(&self) -> Result<Vec<ImageRecord>, BlobStoreError> {
        Ok(self.records()?.values().cloned().collect())
    }

    fn clear(&self) -> Result<(), BlobStoreError> {
        self.records()?.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, BlobStoreError> {
        Ok(self.records()?.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexRow {
    mime_type: Option<String>,
    size: u64,
}

/// Directory-backed blob store: one file per record under `blobs/` plus an
/// `index.json` table of filename to MIME type and size.
#[derive(Debug)]
pub struct DirBlobStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
    lock: Mutex<()>,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
            lock: Mutex::new(()),
        }
    }

    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn read_index(&self) -> BTreeMap<String, IndexRow> {
        let Ok(raw) = std::fs::read_to_string(self.index_path()) else {
            return BTreeMap::new();
        };
        match serde_json::from_str(&raw) {
            Ok(index) => index,
            Err(err) => {
                warn!(
                    path = %self.index_path().display(),
                    error = %err,
                    "blob index unreadable; treating store as empty"
                );
                BTreeMap::new()
            }
        }
    }

    fn write_index(&self, index: &BTreeMap<String, IndexRow>) -> Result<(), BlobStoreError> {
        std::fs::create_dir_all(&self.root)?;
        let staging = self.root.join(".index.json.partial");
        std::fs::write(&staging, serde_json::to_string_pretty(index)?)?;
        std::fs::rename(&staging, self.index_path())?;
        Ok(())
    }

    fn read_record(
        &self,
        filename: &str,
        row: &IndexRow,
    ) -> Result<Option<ImageRecord>, BlobStoreError> {
        match std::fs::read(self.blob_dir().join(filename)) {
            Ok(bytes) => Ok(Some(ImageRecord {
                filename: filename.to_string(),
                bytes: bytes.into(),
                mime_type: row.mime_type.clone(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, BlobStoreError> {
        self.lock.lock().map_err(|_| BlobStoreError::LockPoisoned)
    }
}

impl LocalBlobStore for DirBlobStore {
    fn put(&self, record: ImageRecord) -> Result<(), BlobStoreError> {
        validate_filename(&record.filename)?;
        let _guard = self.guard()?;
        let mut index = self.read_index();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = index
                .iter()
                .filter(|(filename, _)| **filename != record.filename)
                .map(|(_, row)| row.size)
                .sum();
            check_quota(&record, used, quota)?;
        }

        let blob_dir = self.blob_dir();
        std::fs::create_dir_all(&blob_dir)?;
        let staging = blob_dir.join(format!(".{}.partial", record.filename));
        std::fs::write(&staging, &record.bytes)?;
        std::fs::rename(&staging, blob_dir.join(&record.filename))?;

        index.insert(
            record.filename.clone(),
            IndexRow {
                mime_type: record.mime_type.clone(),
                size: record.size(),
            },
        );
        self.write_index(&index)?;
        debug!(filename = %record.filename, size = record.size(), "stored image blob");
        Ok(())
    }

    fn get(&self, filename: &str) -> Result<Option<ImageRecord>, BlobStoreError> {
        if validate_filename(filename).is_err() {
            return Ok(None);
        }
        let index = self.read_index();
        let Some(row) = index.get(filename) else {
            return Ok(None);
        };
        self.read_record(filename, row)
    }

    fn get_all(&self) -> Result<Vec<ImageRecord>, BlobStoreError> {
        let index = self.read_index();
        let mut out = Vec::with_capacity(index.len());
        for (filename, row) in &index {
            match self.read_record(filename, row)? {
                Some(record) => out.push(record),
                None => warn!(filename = %filename, "blob index references a missing file"),
            }
        }
        Ok(out)
    }

    fn clear(&self) -> Result<(), BlobStoreError> {
        let _guard = self.guard()?;
        match std::fs::remove_dir_all(self.blob_dir()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.write_index(&BTreeMap::new())
    }

    fn len(&self) -> Result<usize, BlobStoreError> {
        Ok(self.read_index().len())
    }
}

fn validate_filename(filename: &str) -> Result<(), BlobStoreError> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.starts_with('.')
        || filename.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BlobStoreError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

fn check_quota(record: &ImageRecord, used: u64, quota: u64) -> Result<(), BlobStoreError> {
    let needed = used + record.size();
    if needed > quota {
        return Err(BlobStoreError::QuotaExceeded {
            filename: record.filename.clone(),
            needed,
            quota,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::{BlobStoreError, DirBlobStore, ImageRecord, LocalBlobStore, MemoryBlobStore};

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    fn stores(temp: &tempfile::TempDir) -> Vec<Box<dyn LocalBlobStore>> {
        vec![
            Box::new(MemoryBlobStore::new()),
            Box::new(DirBlobStore::new(temp.path().join("images"))),
        ]
    }

    #[test]
    fn put_get_and_absent_lookup() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        for store in stores(&temp) {
            store.put(ImageRecord::new("a.png", PNG_HEADER.to_vec()))?;
            let record = store.get("a.png")?.expect("record stored");
            assert_eq!(&*record.bytes, PNG_HEADER);
            assert_eq!(record.mime_type.as_deref(), Some("image/png"));
            assert!(store.get("missing.png")?.is_none());
        }
        Ok(())
    }

    #[test]
    fn rewrite_replaces_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        for store in stores(&temp) {
            store.put(ImageRecord::new("a.png", b"first".to_vec()))?;
            store.put(ImageRecord::new("a.png", b"second".to_vec()))?;
            assert_eq!(&*store.get("a.png")?.expect("record").bytes, b"second");
            assert_eq!(store.len()?, 1);
        }
        Ok(())
    }

    #[test]
    fn get_all_and_clear() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        for store in stores(&temp) {
            store.put(ImageRecord::new("a.png", b"a".to_vec()))?;
            store.put(ImageRecord::new("b.png", b"b".to_vec()))?;
            let mut names: Vec<String> = store
                .get_all()?
                .into_iter()
                .map(|record| record.filename)
                .collect();
            names.sort();
            assert_eq!(names, vec!["a.png", "b.png"]);

            store.clear()?;
            assert!(store.is_empty()?);
            assert!(store.get("a.png")?.is_none());
        }
        Ok(())
    }

    #[test]
    fn quota_failure_is_per_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let quota_stores: Vec<Box<dyn LocalBlobStore>> = vec![
            Box::new(MemoryBlobStore::with_quota(Some(8))),
            Box::new(DirBlobStore::new(temp.path().join("images")).with_quota(Some(8))),
        ];
        for store in quota_stores {
            store.put(ImageRecord::new("a.png", vec![0u8; 6]))?;
            let err = store.put(ImageRecord::new("b.png", vec![0u8; 6])).err();
            assert!(matches!(err, Some(BlobStoreError::QuotaExceeded { .. })));
            // Replacing a record only counts its new size.
            store.put(ImageRecord::new("a.png", vec![1u8; 8]))?;
            assert_eq!(store.len()?, 1);
        }
        Ok(())
    }

    #[test]
    fn rejects_path_like_filenames() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        for store in stores(&temp) {
            for bad in ["../escape.png", "nested/a.png", "", ".hidden"] {
                let err = store.put(ImageRecord::new(bad, b"x".to_vec())).err();
                assert!(matches!(err, Some(BlobStoreError::InvalidFilename(_))));
            }
        }
        Ok(())
    }

    #[test]
    fn dir_store_persists_across_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("images");
        DirBlobStore::new(&root).put(ImageRecord::new("a.png", PNG_HEADER.to_vec()))?;
        let reopened = DirBlobStore::new(&root);
        let record = reopened.get("a.png")?.expect("persisted");
        assert_eq!(record.mime_type.as_deref(), Some("image/png"));
        Ok(())
    }

    #[test]
    fn concurrent_writers_to_distinct_keys_all_land() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = Arc::new(DirBlobStore::new(temp.path().join("images")));
        let handles: Vec<_> = (0..8)
            .map(|idx| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.put(ImageRecord::new(format!("img-{idx}.png"), vec![idx as u8; 4]))
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread")?;
        }
        assert_eq!(store.len()?, 8);
        assert_eq!(&*store.get("img-3.png")?.expect("record").bytes, &[3u8; 4]);
        Ok(())
    }

    #[test]
    fn same_key_writers_serialize_without_disturbing_other_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let stores: Vec<Arc<dyn LocalBlobStore>> = vec![
            Arc::new(MemoryBlobStore::new()),
            Arc::new(DirBlobStore::new(temp.path().join("images"))),
        ];
        for store in stores {
            store.put(ImageRecord::new("other.png", vec![7u8; 32]))?;
            store.put(ImageRecord::new("same.png", vec![0u8; 64]))?;

            let writers: Vec<_> = (1..=16u8)
                .map(|idx| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || store.put(ImageRecord::new("same.png", vec![idx; 64])))
                })
                .collect();
            let reader = {
                let store = Arc::clone(&store);
                thread::spawn(move || -> Result<usize, BlobStoreError> {
                    let mut bad_reads = 0;
                    for _ in 0..200 {
                        let other = store.get("other.png")?;
                        if other.map(|record| record.bytes.to_vec()) != Some(vec![7u8; 32]) {
                            bad_reads += 1;
                        }
                        if let Some(same) = store.get("same.png")? {
                            let first = same.bytes.first().copied();
                            let uniform = same.bytes.len() == 64
                                && same.bytes.iter().all(|byte| Some(*byte) == first);
                            if !uniform {
                                bad_reads += 1;
                            }
                        }
                    }
                    Ok(bad_reads)
                })
            };

            for writer in writers {
                writer.join().expect("writer thread")?;
            }
            assert_eq!(reader.join().expect("reader thread")?, 0);
            assert_eq!(store.len()?, 2);
            let last = store.get("same.png")?.expect("record");
            assert_eq!(last.bytes.len(), 64);
            assert!((1..=16u8).contains(&last.bytes[0]));
        }
        Ok(())
    }
}
