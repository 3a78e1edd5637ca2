//! Error types for the liveness and dispatch layers.
//!
//! Every failure in this crate is local and recoverable. The enums here exist
//! so the loops can log and report failures with structure; none of them is
//! ever allowed to escape a running service loop.

use std::path::PathBuf;

/// Probe transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Server answered with a non-success HTTP status.
    #[error("HTTP error: {status} - {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Server answered with a JSON-RPC error envelope.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the server.
        message: String,
    },

    /// The request never produced a response.
    #[error("HTTP client error: {0}")]
    Request(#[from] reqwest::Error),

    /// The transport refused the request outright.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The request did not settle within the allowed time.
    #[error("Probe request timed out after {timeout_ms}ms")]
    TimedOut {
        /// Time allowed for the request.
        timeout_ms: u64,
    },

    /// The probe endpoint could not be joined onto the base URL.
    #[error("Invalid endpoint {endpoint}: {source}")]
    InvalidEndpoint {
        /// Endpoint path as configured.
        endpoint: String,
        /// Parse failure.
        #[source]
        source: url::ParseError,
    },
}

/// Cursor persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("Cursor store I/O error at {path}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Stored value could not be encoded or decoded.
    #[error("Cursor encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A lock guarding in-memory state was poisoned.
    #[error("Cursor store poisoned: {0}")]
    Poisoned(String),
}

/// Notification bus failures.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The polling loop could not be started.
    #[error("Bus failed to start polling: {0}")]
    StartFailed(String),

    /// The bus has been shut down.
    #[error("Bus closed")]
    Closed,
}

/// Error returned by a channel callback.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Create a handler error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler error wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Message describing the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("payload decoding failed", err)
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Config text is not valid TOML for [`crate::LinkConfig`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but failed validation.
    #[error("Invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A fault observed while dispatching a notification batch.
///
/// Faults are handed to a [`crate::dispatch::FaultReporter`]; they never abort
/// the batch that produced them.
#[derive(Debug, thiserror::Error)]
pub enum DispatchFault {
    /// A channel callback returned an error.
    #[error("Channel {channel} callback failed: {error}")]
    Callback {
        /// Application channel name.
        channel: String,
        /// Error returned by the callback.
        #[source]
        error: HandlerError,
    },

    /// A channel callback panicked.
    #[error("Channel {channel} callback panicked: {message}")]
    Panicked {
        /// Application channel name.
        channel: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// The cursor for a processed batch could not be saved.
    #[error("Failed to persist cursor under {key}: {error}")]
    CursorPersist {
        /// Persistence key.
        key: String,
        /// Store failure.
        #[source]
        error: StoreError,
    },
}

impl DispatchFault {
    /// Channel name the fault belongs to, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Callback { channel, .. } | Self::Panicked { channel, .. } => Some(channel),
            Self::CursorPersist { .. } => None,
        }
    }
}

/// Top-level error for fallible setup paths.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cursor store problem.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Bus problem.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Probe transport problem.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for setup operations.
pub type LinkResult<T> = Result<T, LinkError>;
