//! Reader facade configuration.

use cogstream_range::RangeReaderConfig;
use cogstream_stream::StreamConfig;
use cogstream_tiff::PlannerConfig;
use serde::{Deserialize, Serialize};

use crate::{ReaderError, Result};

/// What a region read does when one tile cannot be fetched or decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileErrorPolicy {
    /// Fail the whole region read.
    #[default]
    Abort,
    /// Leave the tile's area filled and return the rest of the region.
    Skip,
}

impl TileErrorPolicy {
    /// Returns the policy as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TileErrorPolicy::Abort => "abort",
            TileErrorPolicy::Skip => "skip",
        }
    }
}

/// Settings for a [`CogReader`](crate::CogReader).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Stream variant and cache settings.
    pub stream: StreamConfig,
    /// Read coalescing settings.
    pub planner: PlannerConfig,
    /// Backend timeouts and retries.
    pub range: RangeReaderConfig,
    /// Handling of failed tiles.
    pub tile_error_policy: TileErrorPolicy,
    /// Fetch and decode tiles on the rayon thread pool.
    pub parallel: bool,
    /// Byte written to output pixels no tile provides.
    pub fill_byte: u8,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            planner: PlannerConfig::default(),
            range: RangeReaderConfig::default(),
            tile_error_policy: TileErrorPolicy::default(),
            parallel: true,
            fill_byte: 0,
        }
    }
}

impl ReaderConfig {
    /// Parse a configuration from YAML text.
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        self.stream
            .validate()
            .map_err(|e| ReaderError::InvalidConfig(e.to_string()))?;
        if self.range.retry.max_attempts == 0 {
            return Err(ReaderError::InvalidConfig(
                "range.retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
