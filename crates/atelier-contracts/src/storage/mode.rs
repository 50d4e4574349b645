use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where image bytes live for the lifetime of the process.
///
/// `Fs` keeps bytes on the server and the client only tracks filenames.
/// `IndexedDb` keeps bytes in the client-side blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    #[serde(rename = "fs")]
    Fs,
    #[serde(rename = "indexeddb")]
    IndexedDb,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::Fs => "fs",
            StorageMode::IndexedDb => "indexeddb",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "fs" => Ok(StorageMode::Fs),
            "indexeddb" => Ok(StorageMode::IndexedDb),
            other => Err(format!("unknown storage mode '{other}'")),
        }
    }
}

/// Picks the storage mode from an explicit override and the deployment signal.
///
/// Only the exact strings `fs` and `indexeddb` count as an override. Managed
/// deployments have no writable filesystem, so they fall back to `IndexedDb`.
pub fn resolve_storage_mode(
    explicit_override: Option<&str>,
    is_managed_deployment_env: bool,
) -> StorageMode {
    if let Some(mode) = explicit_override.and_then(|raw| raw.parse::<StorageMode>().ok()) {
        return mode;
    }
    if is_managed_deployment_env {
        return StorageMode::IndexedDb;
    }
    StorageMode::Fs
}

/// `production` and `preview` deployments are managed and read-only.
pub fn is_managed_deployment(deployment_env: Option<&str>) -> bool {
    matches!(deployment_env, Some("production") | Some("preview"))
}
