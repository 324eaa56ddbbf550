//! # transport
//!
//! why: the node actor sends rpcs without knowing how bytes reach a peer
//! relations: implemented by network.rs for in-process clusters; called from node.rs rpc tasks
//! what: Transport trait, TransportError

use async_trait::async_trait;
use raft_core::{AppendEntriesRequest, AppendEntriesResponse, NodeId, VoteRequest, VoteResponse};
use thiserror::Error;

/// Why an rpc produced no response. Never shown to clients: the caller
/// treats every variant as a lost message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc to peer {0} timed out")]
    Timeout(NodeId),

    #[error("transport is closed")]
    Closed,
}

/// Delivery of raft rpcs to peers.
///
/// Implementations may lose, delay or duplicate messages; the node copes
/// with all three. They must be cheap to clone since every outbound rpc
/// runs on its own task.
#[async_trait]
pub trait Transport: Send + Sync + Clone + 'static {
    async fn request_vote(
        &self,
        to: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn pre_vote(&self, to: NodeId, req: VoteRequest) -> Result<VoteResponse, TransportError>;

    async fn append_entries(
        &self,
        to: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}
