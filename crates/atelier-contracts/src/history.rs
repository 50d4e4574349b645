use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::cost::CostDetails;
use crate::request::{Background, Moderation, Quality, RequestMode};
use crate::storage::{KeyValueStore, KvError, StorageMode};

/// Key/value slot holding the serialized history list.
pub const HISTORY_STORAGE_KEY: &str = "openaiImageHistory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryImage {
    pub filename: String,
}

/// One past generate/edit outcome. Holds filenames only, never image bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Creation time in milliseconds since the epoch; also the entry's identity.
    pub timestamp: i64,
    pub images: Vec<HistoryImage>,
    #[serde(default = "legacy_storage_mode")]
    pub storage_mode_used: StorageMode,
    pub duration_ms: u64,
    pub quality: Quality,
    pub background: Background,
    pub moderation: Moderation,
    pub prompt: String,
    pub mode: RequestMode,
    #[serde(default)]
    pub cost_details: Option<CostDetails>,
}

impl HistoryEntry {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.images.iter().map(|image| image.filename.as_str())
    }
}

fn legacy_storage_mode() -> StorageMode {
    StorageMode::Fs
}

/// Newest-first history list, persisted whole on every mutation.
///
/// Persistence is best effort: when a write fails the in-memory list keeps
/// the mutation and the error is returned for the caller to surface.
#[derive(Debug)]
pub struct HistoryStore {
    kv: KeyValueStore,
    entries: Vec<HistoryEntry>,
}

impl HistoryStore {
    /// Loads the persisted list, discarding it if it cannot be parsed.
    pub fn load(kv: KeyValueStore) -> Self {
        let entries = match kv.get_item(HISTORY_STORAGE_KEY) {
            None => Vec::new(),
            Some(raw) => match serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(error = %err, "discarding malformed image history");
                    if let Err(err) = kv.remove_item(HISTORY_STORAGE_KEY) {
                        error!(error = %err, "failed to remove malformed image history");
                    }
                    Vec::new()
                }
            },
        };
        debug!(entries = entries.len(), "loaded image history");
        Self { kv, entries }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, timestamp: i64) -> Option<&HistoryEntry> {
        self.entries.iter().find(|entry| entry.timestamp == timestamp)
    }

    pub fn append(&mut self, entry: HistoryEntry) -> Result<(), KvError> {
        self.entries.insert(0, entry);
        self.persist()
    }

    /// Swaps in `entries` wholesale. An empty list removes the stored key.
    pub fn replace_all(&mut self, entries: Vec<HistoryEntry>) -> Result<(), KvError> {
        self.entries = entries;
        if self.entries.is_empty() {
            return self.kv.remove_item(HISTORY_STORAGE_KEY).map_err(|err| {
                error!(error = %err, "failed to clear image history");
                err
            });
        }
        self.persist()
    }

    fn persist(&mut self) -> Result<(), KvError> {
        let serialized = serde_json::to_string(&self.entries)?;
        self.kv
            .set_item(HISTORY_STORAGE_KEY, &serialized)
            .map_err(|err| {
                error!(error = %err, entries = self.entries.len(), "failed to save image history");
                err
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{HistoryEntry, HistoryImage, HistoryStore, HISTORY_STORAGE_KEY};
    use crate::cost::CostDetails;
    use crate::request::{Background, Moderation, Quality, RequestMode};
    use crate::storage::{KeyValueStore, KvError, StorageMode};

    fn entry(timestamp: i64, filename: &str) -> HistoryEntry {
        HistoryEntry {
            timestamp,
            images: vec![HistoryImage {
                filename: filename.to_string(),
            }],
            storage_mode_used: StorageMode::IndexedDb,
            duration_ms: 1200,
            quality: Quality::High,
            background: Background::Transparent,
            moderation: Moderation::Low,
            prompt: format!("prompt {timestamp}"),
            mode: RequestMode::Generate,
            cost_details: Some(CostDetails {
                estimated_cost_usd: 0.1676,
                text_input_tokens: 40,
                image_input_tokens: 100,
                image_output_tokens: 4160,
            }),
        }
    }

    #[test]
    fn round_trips_lists_of_any_length() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("local_storage.json");
        for count in [0usize, 1, 5] {
            let list: Vec<HistoryEntry> = (0..count)
                .map(|idx| entry(1_700_000_000_000 + idx as i64, &format!("img-{idx}.png")))
                .collect();
            let mut store = HistoryStore::load(KeyValueStore::new(&path));
            store.replace_all(list.clone())?;

            let reloaded = HistoryStore::load(KeyValueStore::new(&path));
            assert_eq!(reloaded.entries(), list.as_slice());
        }
        Ok(())
    }

    #[test]
    fn append_prepends_newest_first() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = HistoryStore::load(KeyValueStore::new(temp.path().join("ls.json")));
        store.append(entry(1, "old.png"))?;
        store.append(entry(2, "new.png"))?;
        let timestamps: Vec<i64> = store.entries().iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![2, 1]);
        assert_eq!(store.find(1).map(|e| e.images[0].filename.as_str()), Some("old.png"));
        Ok(())
    }

    #[test]
    fn persisted_payload_uses_camel_case_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ls.json");
        let mut store = HistoryStore::load(KeyValueStore::new(&path));
        store.append(entry(7, "a.png"))?;

        let raw = KeyValueStore::new(&path)
            .get_item(HISTORY_STORAGE_KEY)
            .unwrap_or_default();
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed[0]["storageModeUsed"], "indexeddb");
        assert_eq!(parsed[0]["durationMs"], 1200);
        assert_eq!(parsed[0]["mode"], "generate");
        assert_eq!(parsed[0]["costDetails"]["image_output_tokens"], 4160);
        Ok(())
    }

    #[test]
    fn malformed_payload_self_heals_to_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ls.json");
        for corrupt in ["not json", "{\"an\": \"object\"}", "[{\"timestamp\": \"x\"}]"] {
            KeyValueStore::new(&path).set_item(HISTORY_STORAGE_KEY, corrupt)?;
            let store = HistoryStore::load(KeyValueStore::new(&path));
            assert!(store.is_empty());
            assert_eq!(KeyValueStore::new(&path).get_item(HISTORY_STORAGE_KEY), None);
        }
        Ok(())
    }

    #[test]
    fn legacy_entries_without_storage_mode_load_as_fs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ls.json");
        let legacy = r#"[{"timestamp": 5, "images": [{"filename": "a.png"}], "durationMs": 10,
            "quality": "auto", "background": "auto", "moderation": "auto",
            "prompt": "p", "mode": "edit", "costDetails": null}]"#;
        KeyValueStore::new(&path).set_item(HISTORY_STORAGE_KEY, legacy)?;
        let store = HistoryStore::load(KeyValueStore::new(&path));
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].storage_mode_used, StorageMode::Fs);
        assert_eq!(store.entries()[0].mode, RequestMode::Edit);
        assert!(store.entries()[0].cost_details.is_none());
        Ok(())
    }

    #[test]
    fn failed_write_keeps_in_memory_state() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let kv = KeyValueStore::new(temp.path().join("ls.json")).with_quota(Some(32));
        let mut store = HistoryStore::load(kv);
        let err = store.append(entry(1, "a.png")).err();
        assert!(matches!(err, Some(KvError::QuotaExceeded { .. })));
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn clearing_removes_the_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ls.json");
        let mut store = HistoryStore::load(KeyValueStore::new(&path));
        store.append(entry(1, "a.png"))?;
        store.replace_all(Vec::new())?;
        assert!(store.is_empty());
        assert_eq!(KeyValueStore::new(&path).get_item(HISTORY_STORAGE_KEY), None);
        Ok(())
    }
}
