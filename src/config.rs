//! Socket configuration loading and building.
//!
//! A [`SocketConfig`] carries the endpoint, caller query parameters and every
//! timing knob of the socket and its channels. It can be built in code with
//! [`SocketConfig::builder`] or read from a JSON file with environment
//! variable overrides via [`SocketConfig::load`].
//!
//! # File format
//!
//! ```json
//! {
//!   "url": "https://example.com/socket",
//!   "params": { "token": "abc" },
//!   "heartbeat_interval_ms": 30000,
//!   "max_rejoin_attempts": 5
//! }
//! ```
//!
//! Missing fields take their defaults from [`crate::constants`].
//!
//! # Environment overrides
//!
//! - `PHX_URL` - endpoint URL
//! - `PHX_HEARTBEAT_MS` - heartbeat interval in milliseconds
//! - `PHX_RECONNECT_MAX_MS` - reconnect delay cap in milliseconds
//! - `PHX_MAX_REJOIN_ATTEMPTS` - channel rejoin cap

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CLOSE_TIMEOUT, CONNECT_TIMEOUT, HEARTBEAT_INTERVAL, JOIN_TIMEOUT, MAX_REJOIN_ATTEMPTS,
    PROTOCOL_VERSION, PUSH_TIMEOUT, RECONNECT_BASE, RECONNECT_MAX, REJOIN_BASE, REJOIN_MAX,
};
use crate::error::Error;

/// Serialize `Duration` fields as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for a [`Socket`](crate::socket::Socket).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    /// Endpoint URL (`http`, `https`, `ws` or `wss`).
    pub url: String,
    /// Caller query parameters appended to the endpoint URL.
    pub params: BTreeMap<String, String>,
    /// Protocol version marker sent as `vsn`.
    pub vsn: String,
    /// Interval between heartbeats.
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// First reconnect delay.
    #[serde(rename = "reconnect_base_ms", with = "duration_ms")]
    pub reconnect_base: Duration,
    /// Reconnect delay cap.
    #[serde(rename = "reconnect_max_ms", with = "duration_ms")]
    pub reconnect_max: Duration,
    /// First channel rejoin delay.
    #[serde(rename = "rejoin_base_ms", with = "duration_ms")]
    pub rejoin_base: Duration,
    /// Channel rejoin delay cap.
    #[serde(rename = "rejoin_max_ms", with = "duration_ms")]
    pub rejoin_max: Duration,
    /// Rejoin attempts before a channel gives up.
    pub max_rejoin_attempts: u32,
    /// Deadline for join replies (also used for automatic rejoins).
    #[serde(rename = "join_timeout_ms", with = "duration_ms")]
    pub join_timeout: Duration,
    /// Default deadline for `push_await` and `leave`.
    #[serde(rename = "push_timeout_ms", with = "duration_ms")]
    pub push_timeout: Duration,
    /// Deadline for establishing the transport.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Bounded wait for a graceful close on disconnect.
    #[serde(rename = "close_timeout_ms", with = "duration_ms")]
    pub close_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4000/socket".to_string(),
            params: BTreeMap::new(),
            vsn: PROTOCOL_VERSION.to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_base: RECONNECT_BASE,
            reconnect_max: RECONNECT_MAX,
            rejoin_base: REJOIN_BASE,
            rejoin_max: REJOIN_MAX,
            max_rejoin_attempts: MAX_REJOIN_ATTEMPTS,
            join_timeout: JOIN_TIMEOUT,
            push_timeout: PUSH_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

impl SocketConfig {
    /// Create a config builder.
    #[must_use]
    pub fn builder() -> SocketConfigBuilder {
        SocketConfigBuilder::default()
    }

    /// Default config file location (`<config dir>/phx-client/config.json`).
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("phx-client")
            .join("config.json"))
    }

    /// Load from a JSON file, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults are used instead.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            log::debug!("Config file {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PHX_URL") {
            self.url = url;
        }

        if let Ok(heartbeat) = std::env::var("PHX_HEARTBEAT_MS") {
            if let Ok(ms) = heartbeat.parse::<u64>() {
                self.heartbeat_interval = Duration::from_millis(ms);
            }
        }

        if let Ok(reconnect_max) = std::env::var("PHX_RECONNECT_MAX_MS") {
            if let Ok(ms) = reconnect_max.parse::<u64>() {
                self.reconnect_max = Duration::from_millis(ms);
            }
        }

        if let Ok(attempts) = std::env::var("PHX_MAX_REJOIN_ATTEMPTS") {
            if let Ok(max) = attempts.parse::<u32>() {
                self.max_rejoin_attempts = max;
            }
        }
    }

    /// Check that the URL can be turned into a WebSocket endpoint and the
    /// timings are usable.
    pub fn validate(&self) -> std::result::Result<(), Error> {
        crate::ws::endpoint_url(&self.url, &self.vsn, &self.params)?;
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig("heartbeat interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`SocketConfig`].
#[derive(Debug, Default)]
pub struct SocketConfigBuilder {
    config: SocketConfig,
}

impl SocketConfigBuilder {
    /// Set the endpoint URL (required).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Add one query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.params.insert(key.into(), value.into());
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_base = base;
        self.config.reconnect_max = max;
        self
    }

    /// Set the channel rejoin backoff bounds and attempt cap.
    pub fn rejoin_backoff(mut self, base: Duration, max: Duration, max_attempts: u32) -> Self {
        self.config.rejoin_base = base;
        self.config.rejoin_max = max;
        self.config.max_rejoin_attempts = max_attempts;
        self
    }

    /// Set the join reply deadline.
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout = timeout;
        self
    }

    /// Set the default push reply deadline.
    pub fn push_timeout(mut self, timeout: Duration) -> Self {
        self.config.push_timeout = timeout;
        self
    }

    /// Set the transport connect deadline.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the graceful close wait.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> std::result::Result<SocketConfig, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
