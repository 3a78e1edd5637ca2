//! Link configuration.
//!
//! Timings are expressed in seconds as floats so fractional intervals can be
//! configured from TOML without a custom duration syntax.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::heartbeat::HeartbeatConfig;

/// Default probe channel name.
pub const DEFAULT_PROBE_CHANNEL: &str = "pos.longpolling";

/// Default probe endpoint.
pub const DEFAULT_PROBE_ENDPOINT: &str = "/pos_longpolling/update";

/// Default marker carried by every probe.
pub const DEFAULT_PROBE_MESSAGE: &str = "PING";

/// Default persistence key for the replay cursor.
pub const DEFAULT_CURSOR_KEY: &str = "bus_last";

/// Longest accepted probe cadence or reply deadline (seconds).
pub const MAX_INTERVAL_SECS: f64 = 7.0 * 24.0 * 3600.0;

const DEFAULT_QUERY_INTERVAL_SECS: f64 = 60.0;
const DEFAULT_RESPONSE_TIMEOUT_SECS: f64 = 10.0;

/// Configuration for one heartbeat connection and its channel dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Tenant (database) identifier, first component of every qualified channel.
    pub tenant: String,

    /// Scope identifier, last component of every qualified channel and the
    /// `pos_id` carried by probes.
    pub scope_id: String,

    /// Cadence between probes while the link is healthy (seconds).
    /// Default: 60.
    pub query_interval_secs: f64,

    /// Deadline for a probe's reply before the link is declared down (seconds).
    /// Default: 10.
    pub response_timeout_secs: f64,

    /// Channel on which the server acknowledges probes.
    pub probe_channel: String,

    /// Endpoint the probe request is sent to.
    pub probe_endpoint: String,

    /// Marker payload carried by every probe.
    pub probe_message: String,

    /// Key under which the replay cursor is persisted.
    pub cursor_key: String,

    /// Log every dispatched payload at debug level.
    pub debug: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            scope_id: String::new(),
            query_interval_secs: DEFAULT_QUERY_INTERVAL_SECS,
            response_timeout_secs: DEFAULT_RESPONSE_TIMEOUT_SECS,
            probe_channel: DEFAULT_PROBE_CHANNEL.to_string(),
            probe_endpoint: DEFAULT_PROBE_ENDPOINT.to_string(),
            probe_message: DEFAULT_PROBE_MESSAGE.to_string(),
            cursor_key: DEFAULT_CURSOR_KEY.to_string(),
            debug: false,
        }
    }
}

impl LinkConfig {
    /// Create a config for a tenant and scope, other fields defaulted.
    #[must_use]
    pub fn new(tenant: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            scope_id: scope_id.into(),
            ..Self::default()
        }
    }

    /// Builder: set the probe cadence.
    #[must_use]
    pub fn with_query_interval_secs(mut self, secs: f64) -> Self {
        self.query_interval_secs = secs;
        self
    }

    /// Builder: set the probe reply deadline.
    #[must_use]
    pub fn with_response_timeout_secs(mut self, secs: f64) -> Self {
        self.response_timeout_secs = secs;
        self
    }

    /// Builder: set the probe channel name.
    #[must_use]
    pub fn with_probe_channel(mut self, channel: impl Into<String>) -> Self {
        self.probe_channel = channel.into();
        self
    }

    /// Builder: set the cursor persistence key.
    #[must_use]
    pub fn with_cursor_key(mut self, key: impl Into<String>) -> Self {
        self.cursor_key = key.into();
        self
    }

    /// Builder: enable payload debug logging.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Probe cadence as a Duration.
    ///
    /// Out-of-range values fall back to the default; [`Self::validate`]
    /// reports them.
    #[must_use]
    pub fn query_interval(&self) -> Duration {
        interval(self.query_interval_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_QUERY_INTERVAL_SECS))
    }

    /// Probe reply deadline as a Duration.
    ///
    /// Out-of-range values fall back to the default; [`Self::validate`]
    /// reports them.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        interval(self.response_timeout_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_RESPONSE_TIMEOUT_SECS))
    }

    /// Timer settings for the heartbeat monitor.
    #[must_use]
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            query_interval: self.query_interval(),
            response_timeout: self.response_timeout(),
        }
    }

    /// Validate configuration, returning errors for invalid values.
    ///
    /// # Errors
    ///
    /// Returns error strings for any invalid configuration values.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if interval(self.query_interval_secs).is_none() {
            errors.push(format!(
                "query_interval_secs must be a number > 0 and <= {MAX_INTERVAL_SECS}, got {}",
                self.query_interval_secs
            ));
        }
        if interval(self.response_timeout_secs).is_none() {
            errors.push(format!(
                "response_timeout_secs must be a number > 0 and <= {MAX_INTERVAL_SECS}, got {}",
                self.response_timeout_secs
            ));
        }
        if self.tenant.is_empty() {
            errors.push("tenant must not be empty".to_string());
        }
        if self.scope_id.is_empty() {
            errors.push("scope_id must not be empty".to_string());
        }
        if self.probe_channel.is_empty() {
            errors.push("probe_channel must not be empty".to_string());
        }
        if self.cursor_key.is_empty() {
            errors.push("cursor_key must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// errors of [`Self::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Convert seconds to a non-zero Duration no longer than [`MAX_INTERVAL_SECS`].
fn interval(secs: f64) -> Option<Duration> {
    if secs > MAX_INTERVAL_SECS {
        return None;
    }
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|duration| !duration.is_zero())
}
