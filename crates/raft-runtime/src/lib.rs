//! # raft-runtime
//!
//! why: run raft-core nodes on tokio with real timers and a pluggable network
//! relations: drives raft-core's RaftNode, persists through raft-storage
//! what: node actor and client handle, election timer, transport contract, in-process network, node config

pub mod config;
pub mod network;
pub mod node;
pub mod timer;
pub mod transport;

pub use config::{ClusterConfig, NodeConfig};
pub use network::{LocalNetwork, LocalTransport};
pub use node::{open_storage, spawn_node, CommitReceipt, NodeStatus, RaftHandle};
pub use timer::ElectionTimer;
pub use transport::{Transport, TransportError};
