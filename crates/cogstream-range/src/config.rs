//! Range reader configuration.
//!
//! Configuration is always handed in by the embedding application; nothing
//! here reads environment variables or files on its own.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry and backoff settings for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Randomize each delay between 50% and 100% of its nominal value.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Settings shared by every range reader backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeReaderConfig {
    /// Per-request timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Connection establishment timeout, in milliseconds.
    pub connect_timeout_ms: u64,
    /// User-Agent header sent by HTTP-based backends.
    pub user_agent: String,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl Default for RangeReaderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            user_agent: concat!("cogstream/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl RangeReaderConfig {
    /// Parse a configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
