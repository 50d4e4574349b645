use std::str::FromStr;

use anyhow::{anyhow, Result};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const LOG_FILTER_ENV: &str = "ATELIER_LOG";
const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Installs the global subscriber. Logs go to stderr so stdout stays clean
/// for command output.
///
/// The filter comes from `ATELIER_LOG` when set, otherwise from `level`.
pub fn init_logging(level: Option<&str>, format: LogFormat) -> Result<()> {
    let filter = build_env_filter(level)?;
    let registry = Registry::default().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    installed.map_err(|err| anyhow!("failed to initialise logging: {err}"))
}

fn build_env_filter(level: Option<&str>) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_FILTER_ENV) {
        return Ok(filter);
    }
    let level = level.unwrap_or(DEFAULT_LEVEL);
    EnvFilter::try_new(level).map_err(|err| anyhow!("invalid log filter '{level}': {err}"))
}
