//! # config
//!
//! why: tunable timing and batching knobs shared by every node in a cluster
//! relations: read by node.rs for batching/pre-vote, by raft-runtime for timers
//! what: RaftConfig, validation, randomized election timeout selection

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Timing configuration for a Raft node. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// How often a leader sends AppendEntries when idle
    pub heartbeat_interval: u64,
    /// Cap on entries carried by one AppendEntries
    pub max_entries_per_append: usize,
    /// Run a pre-vote round before bumping the term
    pub pre_vote: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            // a tenth of the shortest election timeout
            heartbeat_interval: 15,
            max_entries_per_append: 64,
            pre_vote: false,
        }
    }
}

impl RaftConfig {
    /// Parse a config from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 {
            return Err(RaftError::Config("election timeout must be positive".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout min {} exceeds max {}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {} must be positive and below election timeout {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config("max_entries_per_append must be positive".into()));
        }
        Ok(())
    }

    /// Pick a fresh election timeout uniformly from the configured range.
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}
