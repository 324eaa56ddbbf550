//! # config
//!
//! why: everything a process needs to bring one cluster member up
//! relations: wraps raft-core's RaftConfig; consumed by node.rs
//! what: ClusterConfig membership, NodeConfig with timeouts and data dir, JSON loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use raft_core::{NodeId, RaftConfig, RaftError, Result};
use serde::{Deserialize, Serialize};

/// Fixed cluster membership: node id to network address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub members: BTreeMap<NodeId, String>,
}

impl ClusterConfig {
    pub fn new(members: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    /// Membership for nodes living in one process, addressed by id.
    pub fn local(ids: &[NodeId]) -> Self {
        Self::new(ids.iter().map(|&id| (id, format!("local://{id}"))))
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn default_rpc_timeout_ms() -> u64 {
    50
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

/// Configuration of a single node process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    /// Upper bound on a single peer RPC
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// How long a client waits for its command to commit
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Where FileStorage keeps state; in-memory storage when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new(node_id: NodeId, cluster: ClusterConfig) -> Self {
        Self {
            node_id,
            cluster,
            raft: RaftConfig::default(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            data_dir: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| RaftError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        if !self.cluster.contains(self.node_id) {
            return Err(RaftError::Config(format!(
                "node {} is not a cluster member {:?}",
                self.node_id,
                self.cluster.ids()
            )));
        }
        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms > self.raft.election_timeout_min {
            return Err(RaftError::Config(format!(
                "rpc timeout {} must be positive and at most election timeout {}",
                self.rpc_timeout_ms, self.raft.election_timeout_min
            )));
        }
        if self.command_timeout_ms == 0 {
            return Err(RaftError::Config("command timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
