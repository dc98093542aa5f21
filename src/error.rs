// src/error.rs

//! Unified error handling for the alerting daemon.
//!
//! Component-level failures are modelled as small sums (`SourceError` for
//! fetch/decode problems, `DeliveryError` for chat destinations) and roll up
//! into the crate-wide `AppError`. The tick loop is a single match over
//! these variants; no error is ever turned into a false-positive alert.

use thiserror::Error;

use crate::utils::retry::Transient;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client construction or request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream source failed
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// A rule referenced a row that the source did not return
    #[error("Reference row '{key}' missing from source response")]
    MissingReference { key: String },

    /// State store read/write failed
    #[error("State error: {0}")]
    State(String),

    /// Every destination rejected the message
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// A tick exceeded its hard time budget
    #[error("tick timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Shutdown requested while the tick was in flight
    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a state store error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Create a delivery error.
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery(message.into())
    }

    /// Create a missing-reference error.
    pub fn missing_reference(key: impl Into<String>) -> Self {
        Self::MissingReference { key: key.into() }
    }
}

/// Failure modes of one source fetch.
///
/// `Transport` and 5xx `HttpStatus` are retried with backoff; `Decode` and
/// `Schema` are final (most likely upstream schema drift). `Empty` is raised
/// by the tick loop when a populated pipeline suddenly sees zero rows.
#[derive(Error, Debug)]
pub enum SourceError {
    /// DNS/TCP/TLS/timeout failure before a response arrived
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response status
    #[error("unexpected HTTP status {code}")]
    HttpStatus { code: u16 },

    /// Response body could not be parsed at all
    #[error("malformed response body: {0}")]
    Decode(String),

    /// Body parsed but the expected structure was missing
    #[error("response missing expected structure: {0}")]
    Schema(String),

    /// Zero rows from a source that previously had data
    #[error("source returned zero rows")]
    Empty,

    /// Shutdown requested between retries
    #[error("fetch cancelled")]
    Cancelled,
}

impl SourceError {
    /// Create a transport error from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Whether this failure should be absorbed by bumping the pipeline's
    /// consecutive-failure counter rather than surfacing as a hard error.
    pub fn is_absorbed(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus { code } => (500..600).contains(code),
            _ => false,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

/// Failure modes of one message delivery attempt.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// DNS/TCP/TLS/timeout failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response status
    #[error("destination returned HTTP {code}")]
    HttpStatus { code: u16 },

    /// 2xx response whose body signalled rejection (e.g. Telegram `ok: false`)
    #[error("destination rejected message: {0}")]
    Rejected(String),

    /// Shutdown requested between retries
    #[error("delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// Create a transport error from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }
}

impl Transient for DeliveryError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus { code } => (500..600).contains(code),
            _ => false,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}
