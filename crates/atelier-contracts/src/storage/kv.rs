use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage quota exceeded writing '{key}' ({size} bytes, quota {quota})")]
    QuotaExceeded { key: String, size: u64, quota: u64 },

    #[error("key/value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("key/value I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// String key/value storage backed by one JSON object file.
///
/// Every call goes to disk. Reads treat a missing or unreadable file as
/// empty. Writes merge into the current on-disk object so instances sharing
/// a file keep each other's keys.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    path: PathBuf,
    quota_bytes: Option<u64>,
}

impl KeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            quota_bytes: None,
        }
    }

    /// Caps the serialized size of the whole file.
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        read_json_object(&self.path)?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        on_disk.insert(key.to_string(), Value::String(value.to_string()));
        let serialized = serde_json::to_string_pretty(&Value::Object(on_disk))?;
        if let Some(quota) = self.quota_bytes {
            let size = serialized.len() as u64;
            if size > quota {
                return Err(KvError::QuotaExceeded {
                    key: key.to_string(),
                    size,
                    quota,
                });
            }
        }
        write_file(&self.path, &serialized)
    }

    pub fn remove_item(&self, key: &str) -> Result<(), KvError> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if on_disk.remove(key).is_none() {
            return Ok(());
        }
        let serialized = serde_json::to_string_pretty(&Value::Object(on_disk))?;
        write_file(&self.path, &serialized)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_file(path: &Path, contents: &str) -> Result<(), KvError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{KeyValueStore, KvError};

    #[test]
    fn set_then_get_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KeyValueStore::new(temp.path().join("local_storage.json"));
        store.set_item("key", "value")?;
        assert_eq!(store.get_item("key").as_deref(), Some("value"));
        assert_eq!(store.get_item("missing"), None);
        Ok(())
    }

    #[test]
    fn corrupt_file_reads_as_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("local_storage.json");
        std::fs::write(&path, "{not json")?;
        let store = KeyValueStore::new(&path);
        assert_eq!(store.get_item("key"), None);
        store.set_item("key", "fresh")?;
        assert_eq!(store.get_item("key").as_deref(), Some("fresh"));
        Ok(())
    }

    #[test]
    fn writers_sharing_a_file_keep_each_others_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("local_storage.json");
        let store_a = KeyValueStore::new(&path);
        let store_b = KeyValueStore::new(&path);

        store_a.set_item("a", "1")?;
        store_b.set_item("b", "2")?;
        store_a.remove_item("missing")?;

        let reloaded = KeyValueStore::new(path);
        assert_eq!(reloaded.get_item("a").as_deref(), Some("1"));
        assert_eq!(reloaded.get_item("b").as_deref(), Some("2"));
        Ok(())
    }

    #[test]
    fn remove_item_deletes_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KeyValueStore::new(temp.path().join("local_storage.json"));
        store.set_item("key", "value")?;
        store.remove_item("key")?;
        assert_eq!(store.get_item("key"), None);
        Ok(())
    }

    #[test]
    fn quota_rejects_oversized_write_and_keeps_previous_state() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store =
            KeyValueStore::new(temp.path().join("local_storage.json")).with_quota(Some(64));
        store.set_item("key", "small")?;

        let err = store.set_item("key", &"x".repeat(256)).err();
        assert!(matches!(err, Some(KvError::QuotaExceeded { .. })));
        assert_eq!(store.get_item("key").as_deref(), Some("small"));
        Ok(())
    }
}
