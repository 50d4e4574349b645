use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use atelier_contracts::storage::{is_managed_deployment, resolve_storage_mode, StorageMode};
use atelier_engine::StorageQuotas;

const DEFAULT_API_BASE: &str = "http://localhost:3000";
const DEFAULT_DATA_DIR: &str = ".atelier";

/// Settings resolved once at startup and handed to everything that needs them.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub storage_mode: StorageMode,
    pub explicit_mode: Option<String>,
    pub deployment_env: Option<String>,
    pub api_base: String,
    pub data_dir: PathBuf,
    pub quotas: StorageQuotas,
    pub request_timeout: Option<Duration>,
}

/// Command-line values that take precedence over the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub storage_mode: Option<String>,
    pub api_base: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env(overrides: &ConfigOverrides) -> Result<Self> {
        Self::from_lookup(overrides, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(overrides: &ConfigOverrides, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                lookup(*key)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
        };

        let explicit_mode = overrides
            .storage_mode
            .clone()
            .or_else(|| env(&["IMAGE_STORAGE_MODE", "NEXT_PUBLIC_IMAGE_STORAGE_MODE"]));
        let deployment_env = env(&["VERCEL_ENV", "NEXT_PUBLIC_VERCEL_ENV"]);
        let storage_mode = resolve_storage_mode(
            explicit_mode.as_deref(),
            is_managed_deployment(deployment_env.as_deref()),
        );

        let int_env = |key: &str| {
            env(&[key])
                .map(|raw| {
                    raw.parse::<u64>()
                        .with_context(|| format!("{key} must be an integer, got '{raw}'"))
                })
                .transpose()
        };
        let quotas = StorageQuotas {
            blob_bytes: int_env("ATELIER_STORAGE_QUOTA_BYTES")?,
            history_bytes: int_env("ATELIER_HISTORY_QUOTA_BYTES")?,
        };
        let request_timeout = int_env("ATELIER_REQUEST_TIMEOUT_SECS")?.map(Duration::from_secs);

        Ok(Self {
            storage_mode,
            explicit_mode,
            deployment_env,
            api_base: overrides
                .api_base
                .clone()
                .or_else(|| env(&["ATELIER_API_BASE"]))
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            data_dir: overrides
                .data_dir
                .clone()
                .or_else(|| env(&["ATELIER_DATA_DIR"]).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            quotas,
            request_timeout,
        })
    }
}
