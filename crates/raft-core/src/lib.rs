//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime's actor, persisted through raft-storage
//! what: node state machine, election logic, log management, message types, storage contract

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state_machine;
pub mod storage;

/// Identifier of a cluster member.
pub type NodeId = u64;

/// Election epoch number.
pub type Term = u64;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, VoteRequest, VoteResponse,
};
pub use node::{AppliedEntry, LeaderState, NodeState, Progress, RaftNode, Role};
pub use state_machine::{MemoryStateMachine, StateMachine};
pub use storage::{InMemoryStorage, Storage};
