//! # network
//!
//! why: run a whole cluster inside one process and cut links at will
//! relations: implements transport.rs's Transport by calling peers' RaftHandle directly
//! what: LocalNetwork registry with bidirectional partitions, per-node LocalTransport

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use raft_core::{AppendEntriesRequest, AppendEntriesResponse, NodeId, VoteRequest, VoteResponse};
use tracing::{debug, trace};

use crate::node::RaftHandle;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Default)]
struct NetworkState {
    nodes: BTreeMap<NodeId, RaftHandle>,
    /// (from, to) pairs whose messages are dropped; always inserted both ways
    partitioned_pairs: BTreeSet<(NodeId, NodeId)>,
    closed: bool,
}

/// Shared switchboard connecting in-process nodes.
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a node reachable under its id.
    pub fn register(&self, handle: RaftHandle) {
        self.lock().nodes.insert(handle.id(), handle);
    }

    /// Remove a node; rpcs to it fail as unreachable.
    pub fn unregister(&self, id: NodeId) {
        self.lock().nodes.remove(&id);
    }

    /// Transport used by node `id` to reach the others.
    pub fn transport(&self, id: NodeId) -> LocalTransport {
        LocalTransport {
            id,
            network: self.clone(),
        }
    }

    /// Partitions the given nodes from each other.
    pub fn partition(&self, nodes: &[NodeId]) {
        let mut state = self.lock();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in &nodes[i + 1..] {
                state.partitioned_pairs.insert((a, b));
                state.partitioned_pairs.insert((b, a));
            }
        }
        debug!(?nodes, "partitioned nodes");
    }

    /// Cut `id` off from every other registered node.
    pub fn isolate(&self, id: NodeId) {
        let mut state = self.lock();
        let others: Vec<NodeId> = state.nodes.keys().copied().filter(|&n| n != id).collect();
        for other in others {
            state.partitioned_pairs.insert((id, other));
            state.partitioned_pairs.insert((other, id));
        }
        debug!(node_id = id, "isolated node");
    }

    /// Heals the partition between the given nodes.
    pub fn heal(&self, nodes: &[NodeId]) {
        let mut state = self.lock();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in &nodes[i + 1..] {
                state.partitioned_pairs.remove(&(a, b));
                state.partitioned_pairs.remove(&(b, a));
            }
        }
    }

    /// Clears all partitions.
    pub fn heal_all(&self) {
        self.lock().partitioned_pairs.clear();
        debug!("healed all partitions");
    }

    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.lock().partitioned_pairs.contains(&(from, to))
    }

    /// Fail every rpc from now on.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftHandle, TransportError> {
        let state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.partitioned_pairs.contains(&(from, to)) {
            trace!(node_id = from, peer_id = to, "dropping rpc across partition");
            return Err(TransportError::Unreachable(to));
        }
        state
            .nodes
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))
    }

    /// A reply must also be able to cross back.
    fn deliver_back(&self, from: NodeId, to: NodeId) -> Result<(), TransportError> {
        if self.is_partitioned(to, from) {
            return Err(TransportError::Unreachable(to));
        }
        Ok(())
    }
}

/// One node's view of a LocalNetwork.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let peer = self.network.route(self.id, to)?;
        let resp = peer
            .request_vote(req)
            .await
            .map_err(|_| TransportError::Unreachable(to))?;
        self.network.deliver_back(self.id, to)?;
        Ok(resp)
    }

    async fn pre_vote(&self, to: NodeId, req: VoteRequest) -> Result<VoteResponse, TransportError> {
        let peer = self.network.route(self.id, to)?;
        let resp = peer
            .pre_vote(req)
            .await
            .map_err(|_| TransportError::Unreachable(to))?;
        self.network.deliver_back(self.id, to)?;
        Ok(resp)
    }

    async fn append_entries(
        &self,
        to: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let peer = self.network.route(self.id, to)?;
        let resp = peer
            .append_entries(req)
            .await
            .map_err(|_| TransportError::Unreachable(to))?;
        self.network.deliver_back(self.id, to)?;
        Ok(resp)
    }
}
