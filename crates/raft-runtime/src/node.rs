//! # node
//!
//! why: turn the sans-io RaftNode into a live cluster member
//! relations: owns a raft_core::RaftNode, an ElectionTimer and a Transport; RaftHandle is its only door
//! what: RaftActor event loop, RaftHandle client api, spawn_node, open_storage
//!
//! Everything that touches the node goes through one mailbox and is handled
//! on one task, so the core never sees concurrent calls. Outbound rpcs run
//! on their own tasks and post their replies back into the same mailbox.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, InMemoryStorage, NodeId, NodeState, RaftError,
    RaftMessage, RaftNode, Result, StateMachine, Storage, Term, VoteRequest, VoteResponse,
};
use raft_storage::FileStorage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::timer::ElectionTimer;
use crate::transport::{Transport, TransportError};

const MAILBOX_CAPACITY: usize = 1024;

/// Proof that a submitted command committed and was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub index: u64,
    pub term: Term,
    /// What the state machine returned for the command
    pub result: Vec<u8>,
}

/// Snapshot of a node for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub offline: bool,
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Event {
    RequestVote {
        req: VoteRequest,
        reply: Reply<VoteResponse>,
    },
    PreVote {
        req: VoteRequest,
        reply: Reply<VoteResponse>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        reply: Reply<AppendEntriesResponse>,
    },
    Submit {
        command: Vec<u8>,
        accepted: Reply<u64>,
        committed: Reply<CommitReceipt>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Resume {
        reply: Reply<()>,
    },
    /// outcome of an rpc this node sent
    RpcReply { from: NodeId, reply: RpcReply },
}

pub(crate) enum RpcReply {
    PreVote(std::result::Result<VoteResponse, TransportError>),
    Vote(std::result::Result<VoteResponse, TransportError>),
    Append(std::result::Result<AppendEntriesResponse, TransportError>),
}

/// Cloneable handle to a running node.
///
/// Every call fails with `RaftError::Shutdown` once the node's task is gone.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    id: NodeId,
    events: mpsc::Sender<Event>,
    command_timeout: Duration,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    async fn call<T>(&self, event: impl FnOnce(Reply<T>) -> Event) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(event(tx))
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Replicate `command` and wait until it is applied.
    ///
    /// Fails with `NotLeader` on a follower (carrying the leader it knows
    /// of), and with `QuorumUnavailable` if the entry was appended but did
    /// not commit within the command timeout. The latter does not mean the
    /// command is lost: it may still commit later.
    pub async fn submit(&self, command: Vec<u8>) -> Result<CommitReceipt> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (committed, committed_rx) = oneshot::channel();
        self.events
            .send(Event::Submit {
                command,
                accepted,
                committed,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;

        let index = accepted_rx.await.map_err(|_| RaftError::Shutdown)??;
        match time::timeout(self.command_timeout, committed_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::QuorumUnavailable { index }),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Status { reply: tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Bring an offline node back once its storage works again.
    pub async fn resume(&self) -> Result<()> {
        self.call(|reply| Event::Resume { reply }).await
    }

    /// Deliver a RequestVote from a peer.
    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.call(|reply| Event::RequestVote { req, reply }).await
    }

    /// Deliver a pre-vote request from a peer.
    pub async fn pre_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.call(|reply| Event::PreVote { req, reply }).await
    }

    /// Deliver an AppendEntries from a peer.
    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|reply| Event::AppendEntries { req, reply }).await
    }
}

/// A client waiting for the entry at some index.
struct Pending {
    term: Term,
    reply: Reply<CommitReceipt>,
}

struct RaftActor<S: Storage, M: StateMachine, T: Transport> {
    node: RaftNode<S, M>,
    transport: T,
    events: mpsc::Sender<Event>,
    mailbox: mpsc::Receiver<Event>,
    timer: ElectionTimer,
    timer_fired: mpsc::UnboundedReceiver<u64>,
    heartbeat: Interval,
    rpc_timeout: Duration,
    pending: BTreeMap<u64, Pending>,
    shutdown: CancellationToken,
}

impl<S, M, T> RaftActor<S, M, T>
where
    S: Storage + Send + 'static,
    M: StateMachine + Send + 'static,
    T: Transport,
{
    async fn run(mut self) {
        info!(
            node_id = self.node.id(),
            term = self.node.current_term(),
            cluster = ?self.node.cluster(),
            "node started"
        );
        self.timer.reset();

        loop {
            let was_leader = self.node.is_leader();
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.mailbox.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some(epoch) = self.timer_fired.recv() => self.on_election_timer(epoch),
                _ = self.heartbeat.tick(), if was_leader => self.node.broadcast_heartbeat(),
            }
            self.after_event(was_leader);
        }

        self.stop();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::RequestVote { req, reply } => {
                let outcome = self.node.handle_vote_request(&req).map(|(resp, reset)| {
                    if reset {
                        self.timer.reset();
                    }
                    resp
                });
                let _ = reply.send(outcome.map_err(|e| self.client_error(e)));
            }
            Event::PreVote { req, reply } => {
                let outcome = self.node.handle_pre_vote_request(&req);
                let _ = reply.send(outcome);
            }
            Event::AppendEntries { req, reply } => {
                let outcome = self.node.handle_append_entries(&req).map(|(resp, reset)| {
                    if reset {
                        self.timer.reset();
                    }
                    resp
                });
                let _ = reply.send(outcome.map_err(|e| self.client_error(e)));
            }
            Event::Submit {
                command,
                accepted,
                committed,
            } => match self.node.submit_command(command) {
                Ok(index) => {
                    let term = self.node.current_term();
                    self.pending.insert(
                        index,
                        Pending {
                            term,
                            reply: committed,
                        },
                    );
                    let _ = accepted.send(Ok(index));
                }
                Err(err) => {
                    let _ = accepted.send(Err(self.client_error(err)));
                }
            },
            Event::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Event::Resume { reply } => {
                let _ = reply.send(self.node.resume());
            }
            Event::RpcReply { from, reply } => self.on_rpc_reply(from, reply),
        }
    }

    fn on_rpc_reply(&mut self, from: NodeId, reply: RpcReply) {
        let outcome = match reply {
            RpcReply::PreVote(Ok(resp)) => {
                self.node.handle_pre_vote_response(from, &resp).map(|started| {
                    // the real election gets a full timeout of its own
                    if started {
                        self.timer.reset();
                    }
                })
            }
            RpcReply::Vote(Ok(resp)) => self.node.handle_vote_response(from, &resp).map(drop),
            RpcReply::Append(Ok(resp)) => self
                .node
                .handle_append_entries_response(from, &resp)
                .map(drop),
            RpcReply::Append(Err(err)) => {
                trace!(node_id = self.node.id(), peer_id = from, error = %err, "append entries failed");
                self.node.replication_failed(from);
                Ok(())
            }
            RpcReply::PreVote(Err(err)) | RpcReply::Vote(Err(err)) => {
                // lost messages are retried by the next timeout or heartbeat
                trace!(node_id = self.node.id(), peer_id = from, error = %err, "rpc failed");
                Ok(())
            }
        };
        if let Err(err) = outcome {
            warn!(node_id = self.node.id(), peer_id = from, error = %err, "failed to handle rpc reply");
        }
    }

    fn on_election_timer(&mut self, epoch: u64) {
        if !self.timer.is_current(epoch) {
            trace!(node_id = self.node.id(), epoch, "ignoring stale election timeout");
            return;
        }
        debug!(
            node_id = self.node.id(),
            term = self.node.current_term(),
            state = %self.node.state(),
            "election timeout"
        );
        if let Err(err) = self.node.on_election_timeout() {
            warn!(node_id = self.node.id(), error = %err, "could not start election");
        }
        if !self.node.is_leader() && !self.node.is_offline() {
            self.timer.reset();
        }
    }

    /// Bookkeeping common to every event: timers follow the role, queued
    /// rpcs go out, applied entries answer their clients.
    fn after_event(&mut self, was_leader: bool) {
        self.resolve_applied();

        if self.node.is_offline() {
            if self.timer.is_armed() {
                self.timer.stop();
            }
            self.node.take_messages();
            self.fail_pending(|| RaftError::Offline);
            return;
        }

        if self.node.is_leader() {
            if !was_leader {
                self.timer.stop();
                self.heartbeat.reset();
            }
        } else if !self.timer.is_armed() {
            self.timer.reset();
        }

        self.drop_overwritten();
        self.dispatch();
    }

    fn resolve_applied(&mut self) {
        for applied in self.node.take_applied() {
            let Some(pending) = self.pending.remove(&applied.index) else {
                continue;
            };
            let outcome = if pending.term == applied.term {
                Ok(CommitReceipt {
                    index: applied.index,
                    term: applied.term,
                    result: applied.result,
                })
            } else {
                Err(RaftError::NotLeader {
                    leader_hint: self.node.leader_id(),
                })
            };
            let _ = pending.reply.send(outcome);
        }
    }

    /// Answer clients whose entry was truncated away or who stopped waiting.
    fn drop_overwritten(&mut self) {
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|&(&index, p)| p.reply.is_closed() || self.node.term_at(index) != Some(p.term))
            .map(|(&index, _)| index)
            .collect();
        let leader_hint = self.node.leader_id();
        for index in stale {
            if let Some(pending) = self.pending.remove(&index) {
                debug!(node_id = self.node.id(), index, "pending command lost its log entry");
                let _ = pending.reply.send(Err(RaftError::NotLeader { leader_hint }));
            }
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> RaftError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(err()));
        }
    }

    fn dispatch(&mut self) {
        for envelope in self.node.take_messages() {
            let to = envelope.to;
            let transport = self.transport.clone();
            let events = self.events.clone();
            let limit = self.rpc_timeout;
            tokio::spawn(async move {
                let reply = match envelope.message {
                    RaftMessage::PreVoteRequest(req) => {
                        RpcReply::PreVote(with_timeout(to, limit, transport.pre_vote(to, req)).await)
                    }
                    RaftMessage::VoteRequest(req) => {
                        RpcReply::Vote(with_timeout(to, limit, transport.request_vote(to, req)).await)
                    }
                    RaftMessage::AppendEntries(req) => RpcReply::Append(
                        with_timeout(to, limit, transport.append_entries(to, req)).await,
                    ),
                    other => {
                        warn!(peer_id = to, message = ?other, "outbox held a response, dropping");
                        return;
                    }
                };
                let _ = events.send(Event::RpcReply { from: to, reply }).await;
            });
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node.id(),
            state: self.node.state(),
            term: self.node.current_term(),
            leader_id: self.node.leader_id(),
            commit_index: self.node.commit_index(),
            last_applied: self.node.last_applied(),
            last_log_index: self.node.last_log_index(),
            offline: self.node.is_offline(),
        }
    }

    fn client_error(&self, err: RaftError) -> RaftError {
        if self.node.is_offline() {
            RaftError::Offline
        } else {
            err
        }
    }

    fn stop(&mut self) {
        self.timer.stop();
        self.fail_pending(|| RaftError::Shutdown);
        info!(
            node_id = self.node.id(),
            term = self.node.current_term(),
            "node stopped"
        );
    }
}

async fn with_timeout<R>(
    to: NodeId,
    limit: Duration,
    rpc: impl Future<Output = std::result::Result<R, TransportError>>,
) -> std::result::Result<R, TransportError> {
    match time::timeout(limit, rpc).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TransportError::Timeout(to)),
    }
}

/// Restore a node from `storage` and run it on the current tokio runtime
/// until `shutdown` is cancelled.
pub fn spawn_node<S, M, T>(
    config: &NodeConfig,
    storage: S,
    state_machine: M,
    transport: T,
    shutdown: CancellationToken,
) -> Result<(RaftHandle, JoinHandle<()>)>
where
    S: Storage + Send + 'static,
    M: StateMachine + Send + 'static,
    T: Transport,
{
    config.validate()?;
    let node = RaftNode::restore(
        config.node_id,
        config.cluster.ids(),
        config.raft.clone(),
        storage,
        state_machine,
    )?;

    let (events, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
    let (timer, timer_fired) = ElectionTimer::new(config.raft.clone());
    let mut heartbeat = time::interval(config.raft.heartbeat());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let handle = RaftHandle {
        id: config.node_id,
        events: events.clone(),
        command_timeout: config.command_timeout(),
    };
    let actor = RaftActor {
        node,
        transport,
        events,
        mailbox,
        timer,
        timer_fired,
        heartbeat,
        rpc_timeout: config.rpc_timeout(),
        pending: BTreeMap::new(),
        shutdown,
    };
    let task = tokio::spawn(actor.run());
    Ok((handle, task))
}

/// Storage named by the config: files under `data_dir`, or memory when unset.
pub fn open_storage(config: &NodeConfig) -> Result<Box<dyn Storage + Send>> {
    match &config.data_dir {
        Some(dir) => Ok(Box::new(FileStorage::new(dir)?)),
        None => Ok(Box::new(InMemoryStorage::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::network::LocalNetwork;
    use async_trait::async_trait;
    use raft_core::MemoryStateMachine;
    use std::sync::{Arc, Mutex};

    fn single(id: NodeId) -> NodeConfig {
        NodeConfig::new(id, ClusterConfig::local(&[id]))
    }

    #[tokio::test(start_paused = true)]
    async fn single_node_elects_itself_and_commits() {
        let network = LocalNetwork::new();
        let shutdown = CancellationToken::new();
        let (handle, _task) = spawn_node(
            &single(1),
            InMemoryStorage::new(),
            MemoryStateMachine::new(),
            network.transport(1),
            shutdown.clone(),
        )
        .unwrap();

        time::sleep(Duration::from_millis(400)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, NodeState::Leader);
        assert_eq!(status.term, 1);

        let receipt = handle.submit(b"x".to_vec()).await.unwrap();
        assert_eq!(receipt.index, 1);
        assert_eq!(receipt.result, 1u64.to_le_bytes().to_vec());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_shutdown_after_cancel() {
        let network = LocalNetwork::new();
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_node(
            &single(1),
            InMemoryStorage::new(),
            MemoryStateMachine::new(),
            network.transport(1),
            shutdown.clone(),
        )
        .unwrap();

        shutdown.cancel();
        task.await.unwrap();

        assert!(matches!(handle.status().await, Err(RaftError::Shutdown)));
        assert!(matches!(
            handle.submit(b"x".to_vec()).await,
            Err(RaftError::Shutdown)
        ));
    }

    /// Grants every pre-vote after a delay and records when each real
    /// election reaches it.
    #[derive(Clone)]
    struct SlowPreVotes {
        elections: Arc<Mutex<Vec<(Term, time::Instant)>>>,
    }

    #[async_trait]
    impl Transport for SlowPreVotes {
        async fn request_vote(
            &self,
            to: NodeId,
            req: VoteRequest,
        ) -> std::result::Result<VoteResponse, TransportError> {
            self.elections.lock().unwrap().push((req.term, time::Instant::now()));
            Err(TransportError::Unreachable(to))
        }

        async fn pre_vote(
            &self,
            _to: NodeId,
            req: VoteRequest,
        ) -> std::result::Result<VoteResponse, TransportError> {
            time::sleep(Duration::from_millis(100)).await;
            Ok(VoteResponse {
                term: req.term,
                vote_granted: true,
            })
        }

        async fn append_entries(
            &self,
            to: NodeId,
            _req: AppendEntriesRequest,
        ) -> std::result::Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable(to))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn election_won_by_pre_vote_gets_a_full_timeout() {
        let mut config = NodeConfig::new(1, ClusterConfig::local(&[1, 2, 3]));
        config.raft.pre_vote = true;
        config.rpc_timeout_ms = 120;
        let transport = SlowPreVotes {
            elections: Arc::new(Mutex::new(Vec::new())),
        };
        let shutdown = CancellationToken::new();
        let (_handle, _task) = spawn_node(
            &config,
            InMemoryStorage::new(),
            MemoryStateMachine::new(),
            transport.clone(),
            shutdown.clone(),
        )
        .unwrap();

        time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();

        let mut starts: BTreeMap<Term, time::Instant> = BTreeMap::new();
        for (term, at) in transport.elections.lock().unwrap().iter() {
            starts.entry(*term).or_insert(*at);
        }
        assert!(starts.len() >= 3, "only {} elections started", starts.len());
        let starts: Vec<time::Instant> = starts.into_values().collect();
        for pair in starts.windows(2) {
            // election timeout minimum plus the pre-vote delay
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(250),
                "elections only {:?} apart",
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let mut config = single(1);
        config.node_id = 2;
        let outcome = spawn_node(
            &config,
            InMemoryStorage::new(),
            MemoryStateMachine::new(),
            LocalNetwork::new().transport(2),
            CancellationToken::new(),
        );
        assert!(matches!(outcome, Err(RaftError::Config(_))));
    }

    #[test]
    fn open_storage_uses_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = single(1);
        config.data_dir = Some(dir.path().join("node-1"));

        let mut storage = open_storage(&config).unwrap();
        storage.save_term_and_vote(4, Some(1)).unwrap();

        assert!(dir.path().join("node-1").join("meta.json").exists());
        assert_eq!(storage.load_term_and_vote().unwrap(), (4, Some(1)));
    }
}
