//! Error types for the station orchestration core

use thiserror::Error;

/// Result type for station operations
pub type StationResult<T> = Result<T, StationError>;

/// Error taxonomy for the orchestration core
#[derive(Error, Debug)]
pub enum StationError {
    /// Missing or invalid static configuration (base URL, credentials)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input validation failed (recipe, chemical data, slots, payloads)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Login failed, or a 401 survived the single re-login retry
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport-level failure (connect, timeout, TLS)
    #[error("Network error calling {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP status >= 400 other than 401
    #[error("HTTP {status} from {endpoint}")]
    Http { endpoint: String, status: u16 },

    /// Response body was not JSON or missed an expected field
    #[error("Unexpected response from {endpoint}: {detail}")]
    Response { endpoint: String, detail: String },

    /// Vendor-level business code != 200
    #[error("Station API error, code={code}, msg={msg}")]
    Api { code: i64, msg: String },

    /// Vendor code 1200: not enough material or consumables on deck
    #[error("Station reports resource shortage: {0}")]
    ResourceShortage(String),

    /// Deadline breached while polling the station
    #[error("Timed out during {stage}, last observed state {last_state:?}")]
    Timeout {
        stage: String,
        last_state: Option<i64>,
    },

    /// Data sink failure (filesystem or serialization)
    #[error("Data sink error: {0}")]
    Sink(String),
}

impl From<std::io::Error> for StationError {
    fn from(err: std::io::Error) -> Self {
        StationError::Sink(err.to_string())
    }
}
