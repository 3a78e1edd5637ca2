//! Tracing subscriber setup.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, prelude::*};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Output format for log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Failure to install the global subscriber.
#[derive(Debug, thiserror::Error)]
#[error("Failed to initialize tracing: {0}")]
pub struct TelemetryError(String);

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns [`TelemetryError`] if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(env_filter());
    let result = match format {
        LogFormat::Pretty => registry.with(tracing_fmt::layer().pretty()).try_init(),
        LogFormat::Json => registry
            .with(tracing_fmt::layer().json().flatten_event(true))
            .try_init(),
    };
    result.map_err(|err| TelemetryError(err.to_string()))
}
