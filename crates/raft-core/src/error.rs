//! # error
//!
//! why: one error type for every way a raft operation can fail
//! relations: returned by node.rs, storage.rs and config.rs; surfaced to clients by raft-runtime
//! what: RaftError taxonomy and the crate-wide Result alias

use std::io;

use thiserror::Error;

use crate::{NodeId, Term};

/// Errors produced by the raft core.
///
/// Only `NotLeader`, `QuorumUnavailable`, `Offline` and `Shutdown` are meant
/// to reach a client; the rest are handled inside the node.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A message or response carried a term older than ours.
    #[error("stale term {received}, current term is {current}")]
    StaleTerm { received: Term, current: Term },

    /// AppendEntries consistency check failed at `prev_log_index`.
    #[error("log has no entry at index {prev_log_index} with term {prev_log_term}")]
    LogInconsistency {
        prev_log_index: u64,
        prev_log_term: Term,
    },

    /// The command was sent to a node that is not the leader.
    #[error("not the leader, current leader is node {leader_hint:?}")]
    NotLeader { leader_hint: Option<NodeId> },

    /// The entry did not reach a majority within the command timeout.
    #[error("no quorum acknowledged entry {index} in time")]
    QuorumUnavailable { index: u64 },

    /// Durable storage rejected a write.
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),

    /// The node lost its storage and refuses to participate.
    #[error("node is offline until storage recovers")]
    Offline,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The node's event loop has stopped.
    #[error("node has shut down")]
    Shutdown,
}

impl RaftError {
    /// True for errors a client should see rather than the node recovering from.
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::QuorumUnavailable { .. }
                | RaftError::Offline
                | RaftError::Shutdown
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
