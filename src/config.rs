//! Runtime configuration for the station driver
//!
//! All knobs are optional with safe defaults and can be overridden through
//! `SYN_STATION_*` environment variables, so the same binary runs against a
//! bench simulator or the production glovebox without a rebuild.

use std::env;
use std::path::PathBuf;

use crate::error::{StationError, StationResult};

/// Connection and storage settings for one station
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Upper-computer service address, e.g. "http://127.0.0.1:4669"
    pub base_url: String,
    /// Login user name
    pub username: String,
    /// Login password
    pub password: String,
    /// Default request timeout in seconds
    pub timeout_s: f64,
    /// Verify TLS certificates (disable for lab-internal self-signed setups)
    pub verify_tls: bool,
    /// Log level filter string, e.g. "info" or "synthstation=debug"
    pub log_level: String,
    /// Root directory for the filesystem data sink
    pub data_dir: PathBuf,
    /// Record snapshots and task records through the sink
    pub enable_data_logging: bool,
    /// Completed task records older than this are removed by the sweep
    pub task_retention_days: i64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4669".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            timeout_s: 30.0,
            verify_tls: true,
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
            enable_data_logging: true,
            task_retention_days: 90,
        }
    }
}

impl StationConfig {
    /// Load settings from `SYN_STATION_*` environment variables,
    /// falling back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string("SYN_STATION_BASE_URL", &defaults.base_url),
            username: env_string("SYN_STATION_USERNAME", &defaults.username),
            password: env_string("SYN_STATION_PASSWORD", &defaults.password),
            timeout_s: env::var("SYN_STATION_TIMEOUT_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_s),
            verify_tls: env_bool("SYN_STATION_VERIFY_TLS", defaults.verify_tls),
            log_level: env_string("SYN_STATION_LOG_LEVEL", &defaults.log_level),
            data_dir: env::var("SYN_STATION_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            enable_data_logging: env_bool(
                "SYN_STATION_ENABLE_DATA_LOGGING",
                defaults.enable_data_logging,
            ),
            task_retention_days: env::var("SYN_STATION_TASK_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.task_retention_days),
        }
    }

    /// Reject configurations that cannot possibly reach a station.
    pub fn validate(&self) -> StationResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(StationError::Config("base_url must not be empty".into()));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(StationError::Config(
                "username and password must not be empty".into(),
            ));
        }
        if self.timeout_s <= 0.0 {
            return Err(StationError::Config(format!(
                "timeout_s must be positive, got {}",
                self.timeout_s
            )));
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Install a global `tracing` subscriber honoring the given filter string.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
