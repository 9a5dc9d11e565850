/// Consensus configuration
///
/// Loaded from JSON; every field has a default so partial files work.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// How the next proposer is picked after a round change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposerPolicy {
    /// Rotate to the validator after the last proposer
    #[default]
    RoundRobin,
    /// Keep the last proposer until a round change
    Sticky,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base round-change timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Target spacing between block timestamps
    pub block_period_secs: u64,

    pub proposer_policy: ProposerPolicy,

    /// Backlogged messages kept per sender before new ones are dropped
    pub max_backlog_per_validator: usize,

    /// Requests parked for future heights
    pub max_pending_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            block_period_secs: 1,
            proposer_policy: ProposerPolicy::RoundRobin,
            max_backlog_per_validator: 1024,
            max_pending_requests: 64,
        }
    }
}

impl Config {
    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        if self.max_backlog_per_validator == 0 {
            return Err(ConfigError::Invalid(
                "max_backlog_per_validator must be positive".into(),
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(ConfigError::Invalid("max_pending_requests must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn block_period(&self) -> Duration {
        Duration::from_secs(self.block_period_secs)
    }
}
