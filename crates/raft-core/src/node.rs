//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, storage.rs for durability
//! what: NodeState/Role, RaftNode with election, replication and commit logic
//!
//! The node performs no I/O of its own. Handlers for incoming requests
//! return the response directly; requests the node wants to send are
//! queued and drained with [`RaftNode::take_messages`]. Committed entries
//! are applied to the state machine inside the node and reported through
//! [`RaftNode::take_applied`].

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, VoteRequest, VoteResponse,
};
use crate::state_machine::{MemoryStateMachine, StateMachine};
use crate::storage::{InMemoryStorage, Storage};
use crate::{NodeId, Term};

/// The possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Probing state - asks whether an election could be won before running one
    PreCandidate,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::PreCandidate => write!(f, "pre-candidate"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Replication progress of one follower, as seen by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Index of the next entry to send
    pub next_index: u64,
    /// Highest index known to be stored on the follower
    pub match_index: u64,
    /// Last index of the batch sent and not yet answered; while set, the
    /// follower only gets empty AppendEntries
    pub inflight: Option<u64>,
}

/// Bookkeeping that only exists while a node leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    progress: BTreeMap<NodeId, Progress>,
}

impl LeaderState {
    fn new(peers: &[NodeId], last_log_index: u64) -> Self {
        let progress = peers
            .iter()
            .map(|&peer| {
                (
                    peer,
                    Progress {
                        next_index: last_log_index + 1,
                        match_index: 0,
                        inflight: None,
                    },
                )
            })
            .collect();
        Self { progress }
    }

    pub fn progress(&self, peer: NodeId) -> Option<&Progress> {
        self.progress.get(&peer)
    }
}

/// Role plus the volatile data that only makes sense in that role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Follower { leader_id: Option<NodeId> },
    /// `term` is the term the pre-vote round proposes
    PreCandidate { term: Term, votes: BTreeSet<NodeId> },
    Candidate { votes: BTreeSet<NodeId> },
    Leader(LeaderState),
}

impl Role {
    pub fn state(&self) -> NodeState {
        match self {
            Role::Follower { .. } => NodeState::Follower,
            Role::PreCandidate { .. } => NodeState::PreCandidate,
            Role::Candidate { .. } => NodeState::Candidate,
            Role::Leader(_) => NodeState::Leader,
        }
    }
}

/// An entry that was just applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry {
    pub index: u64,
    pub term: Term,
    pub result: Vec<u8>,
}

/// A single Raft node in the cluster
pub struct RaftNode<S: Storage = InMemoryStorage, M: StateMachine = MemoryStateMachine> {
    id: NodeId,
    /// every member, this node included
    cluster: Vec<NodeId>,
    config: RaftConfig,

    // persistent, always written to storage first
    current_term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog,

    // volatile
    commit_index: u64,
    last_applied: u64,
    role: Role,
    offline: bool,

    storage: S,
    state_machine: M,
    outbox: Vec<Envelope>,
    applied: Vec<AppliedEntry>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state backed by in-memory storage.
    pub fn new(id: NodeId, cluster: Vec<NodeId>) -> Result<Self> {
        Self::with_config(id, cluster, RaftConfig::default())
    }

    /// Same checks as [`RaftNode::restore`]: a valid config and `id` in `cluster`.
    pub fn with_config(id: NodeId, cluster: Vec<NodeId>, config: RaftConfig) -> Result<Self> {
        Self::restore(
            id,
            cluster,
            config,
            InMemoryStorage::new(),
            MemoryStateMachine::new(),
        )
    }
}

impl<S: Storage, M: StateMachine> RaftNode<S, M> {
    fn fresh(id: NodeId, mut cluster: Vec<NodeId>, config: RaftConfig, storage: S, state_machine: M) -> Self {
        cluster.sort_unstable();
        cluster.dedup();
        Self {
            id,
            cluster,
            config,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower { leader_id: None },
            offline: false,
            storage,
            state_machine,
            outbox: Vec::new(),
            applied: Vec::new(),
        }
    }

    /// Build a node from whatever `storage` holds: term, vote and log are
    /// reloaded, everything volatile starts over as a follower.
    pub fn restore(
        id: NodeId,
        cluster: Vec<NodeId>,
        config: RaftConfig,
        storage: S,
        state_machine: M,
    ) -> Result<Self> {
        config.validate()?;
        if !cluster.contains(&id) {
            return Err(RaftError::Config(format!("node {id} is not in cluster {cluster:?}")));
        }
        let (term, voted_for) = storage.load_term_and_vote()?;
        let log = RaftLog::from_entries(storage.load_log()?);

        let mut node = Self::fresh(id, cluster, config, storage, state_machine);
        node.current_term = term;
        node.voted_for = voted_for;
        node.log = log;
        info!(
            node_id = id,
            term,
            voted_for = ?voted_for,
            last_log_index = node.log.last_index(),
            "restored persistent state"
        );
        Ok(node)
    }

    // -- accessors --

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.role.state()
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn cluster(&self) -> &[NodeId] {
        &self.cluster
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.cluster.iter().copied().filter(|&n| n != self.id).collect()
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    /// Best known leader: ourselves when leading, otherwise whoever last
    /// sent us a valid AppendEntries in this term.
    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader(_) => Some(self.id),
            Role::Follower { leader_id } => *leader_id,
            _ => None,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get_entry(index)
    }

    pub fn term_at(&self, index: u64) -> Option<Term> {
        self.log.term_at(index)
    }

    /// Strict majority of the cluster, self included.
    pub fn quorum_size(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    /// Votes gathered in the current (pre-)election, if one is running.
    pub fn votes_received(&self) -> Option<&BTreeSet<NodeId>> {
        match &self.role {
            Role::PreCandidate { votes, .. } | Role::Candidate { votes } => Some(votes),
            _ => None,
        }
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received()
            .map(|votes| votes.len() >= self.quorum_size())
            .unwrap_or(false)
    }

    /// Leader's view of a follower's replication progress.
    pub fn progress(&self, peer: NodeId) -> Option<Progress> {
        match &self.role {
            Role::Leader(leader) => leader.progress(peer).copied(),
            _ => None,
        }
    }

    /// Drain requests queued for peers.
    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Drain entries applied to the state machine since the last call.
    pub fn take_applied(&mut self) -> Vec<AppliedEntry> {
        std::mem::take(&mut self.applied)
    }

    // -- durability --

    fn ensure_online(&self) -> Result<()> {
        if self.offline {
            return Err(RaftError::Offline);
        }
        Ok(())
    }

    fn go_offline(&mut self, err: &io::Error) {
        error!(
            node_id = self.id,
            term = self.current_term,
            error = %err,
            "storage failure, node going offline"
        );
        self.offline = true;
        self.role = Role::Follower { leader_id: None };
        self.outbox.clear();
    }

    fn persist_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        debug_assert!(term >= self.current_term, "term must never regress");
        if let Err(err) = self.storage.save_term_and_vote(term, voted_for) {
            self.go_offline(&err);
            return Err(err.into());
        }
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn persist_append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.storage.append_entries(entries) {
            self.go_offline(&err);
            return Err(err.into());
        }
        self.log.append(entries);
        Ok(())
    }

    fn persist_truncate(&mut self, from_index: u64) -> Result<()> {
        debug_assert!(from_index > self.commit_index, "committed entries are immutable");
        if let Err(err) = self.storage.truncate_log_from(from_index) {
            self.go_offline(&err);
            return Err(err.into());
        }
        self.log.truncate_from(from_index);
        Ok(())
    }

    /// Try to bring an offline node back by re-persisting its hard state.
    pub fn resume(&mut self) -> Result<()> {
        if !self.offline {
            return Ok(());
        }
        self.storage.save_term_and_vote(self.current_term, self.voted_for)?;
        self.offline = false;
        self.role = Role::Follower { leader_id: None };
        info!(node_id = self.id, term = self.current_term, "storage healthy again, rejoining");
        Ok(())
    }

    // -- term handling --

    fn check_term(&self, term: Term) -> Result<()> {
        if term < self.current_term {
            return Err(RaftError::StaleTerm {
                received: term,
                current: self.current_term,
            });
        }
        Ok(())
    }

    /// Revert to follower, adopting `term` if it is newer than ours.
    pub fn become_follower(&mut self, term: Term) -> Result<()> {
        self.step_down(term, None)
    }

    fn step_down(&mut self, term: Term, leader_id: Option<NodeId>) -> Result<()> {
        if term > self.current_term {
            self.persist_term_and_vote(term, None)?;
        }
        if self.is_leader() {
            info!(node_id = self.id, term, "stepping down from leader");
        }
        self.role = Role::Follower { leader_id };
        Ok(())
    }

    fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.outbox.push(Envelope {
            from: self.id,
            to,
            message,
        });
    }

    // -- elections --

    /// Called when the election timer fires.
    pub fn on_election_timeout(&mut self) -> Result<()> {
        self.ensure_online()?;
        match self.role {
            Role::Leader(_) => Ok(()),
            _ if self.config.pre_vote && self.cluster.len() > 1 => {
                self.start_pre_vote();
                Ok(())
            }
            _ => self.start_election().map(|_| ()),
        }
    }

    fn start_pre_vote(&mut self) {
        let mut votes = BTreeSet::new();
        votes.insert(self.id);
        let term = self.current_term + 1;
        self.role = Role::PreCandidate { term, votes };

        let req = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        debug!(node_id = self.id, proposed_term = req.term, "starting pre-vote");
        for peer in self.peers() {
            self.send(peer, RaftMessage::PreVoteRequest(req.clone()));
        }
    }

    /// Bump the term, vote for ourselves and ask every peer for a vote.
    pub fn start_election(&mut self) -> Result<VoteRequest> {
        self.ensure_online()?;
        let term = self.current_term + 1;
        self.persist_term_and_vote(term, Some(self.id))?;

        let mut votes = BTreeSet::new();
        votes.insert(self.id);
        self.role = Role::Candidate { votes };

        let req = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        info!(
            node_id = self.id,
            term,
            last_log_index = req.last_log_index,
            "starting election"
        );
        for peer in self.peers() {
            self.send(peer, RaftMessage::VoteRequest(req.clone()));
        }

        if self.has_quorum() {
            self.become_leader();
        }
        Ok(req)
    }

    /// Answer a RequestVote. The bool says whether the election timer
    /// should be reset (true whenever the vote is granted).
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> Result<(VoteResponse, bool)> {
        self.ensure_online()?;
        if let Err(err) = self.check_term(req.term) {
            debug!(node_id = self.id, candidate = req.candidate_id, %err, "rejecting vote request");
            return Ok((self.vote_response(false), false));
        }
        if req.term > self.current_term {
            self.step_down(req.term, None)?;
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(req.candidate_id);
        let up_to_date = self.log.is_up_to_date(req.last_log_index, req.last_log_term);
        let granted = can_vote && up_to_date;
        if granted && self.voted_for != Some(req.candidate_id) {
            self.persist_term_and_vote(self.current_term, Some(req.candidate_id))?;
        }

        debug!(
            node_id = self.id,
            candidate = req.candidate_id,
            term = req.term,
            granted,
            up_to_date,
            "RequestVote response"
        );
        Ok((self.vote_response(granted), granted))
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Answer a pre-vote. Never changes any state.
    ///
    /// A grant echoes the proposed term so the candidate can tell which of
    /// its rounds it belongs to; a refusal carries our current term.
    pub fn handle_pre_vote_request(&self, req: &VoteRequest) -> Result<VoteResponse> {
        self.ensure_online()?;
        let has_leader = self.leader_id().is_some();
        let granted = req.term > self.current_term
            && !has_leader
            && self.log.is_up_to_date(req.last_log_index, req.last_log_term);
        trace!(
            node_id = self.id,
            candidate = req.candidate_id,
            proposed_term = req.term,
            granted,
            "PreVote response"
        );
        if granted {
            return Ok(VoteResponse {
                term: req.term,
                vote_granted: true,
            });
        }
        Ok(self.vote_response(false))
    }

    /// Count a pre-vote. Returns true if it completed a majority and a
    /// real election was started.
    pub fn handle_pre_vote_response(&mut self, from: NodeId, resp: &VoteResponse) -> Result<bool> {
        self.ensure_online()?;
        if resp.term > self.current_term && !resp.vote_granted {
            self.step_down(resp.term, None)?;
            return Ok(false);
        }
        let Role::PreCandidate { term, votes } = &mut self.role else {
            return Ok(false);
        };
        if !resp.vote_granted {
            return Ok(false);
        }
        if resp.term != *term {
            debug!(
                node_id = self.id,
                peer_id = from,
                granted_term = resp.term,
                proposed_term = *term,
                "discarding pre-vote from an earlier round"
            );
            return Ok(false);
        }
        votes.insert(from);
        if self.has_quorum() {
            self.start_election()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Count a vote. Returns true if this vote made us leader.
    pub fn handle_vote_response(&mut self, from: NodeId, resp: &VoteResponse) -> Result<bool> {
        self.ensure_online()?;
        if resp.term > self.current_term {
            self.step_down(resp.term, None)?;
            return Ok(false);
        }
        if let Err(err) = self.check_term(resp.term) {
            debug!(node_id = self.id, peer_id = from, %err, "discarding vote response");
            return Ok(false);
        }
        let Role::Candidate { votes } = &mut self.role else {
            return Ok(false);
        };
        if resp.vote_granted {
            votes.insert(from);
            debug!(node_id = self.id, peer_id = from, votes = votes.len(), "received vote");
        }
        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    fn become_leader(&mut self) {
        let peers = self.peers();
        self.role = Role::Leader(LeaderState::new(&peers, self.log.last_index()));
        info!(
            node_id = self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            "became leader"
        );
        // a single-node cluster may already hold a majority of everything
        self.advance_commit_index();
        self.broadcast_heartbeat();
    }

    // -- replication, leader side --

    /// Build the next AppendEntries for `peer` from its progress.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<AppendEntriesRequest> {
        let Role::Leader(leader) = &self.role else {
            return None;
        };
        let progress = leader.progress(peer)?;
        let prev_log_index = progress.next_index.saturating_sub(1);
        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self
                .log
                .entries_from(progress.next_index, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    /// Send `peer` its next batch, or an empty AppendEntries while a
    /// batch is still unanswered.
    fn replicate_to(&mut self, peer: NodeId) {
        let Some(mut req) = self.create_append_entries(peer) else {
            return;
        };
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(&peer) else {
            return;
        };
        if progress.inflight.is_some() {
            req.entries.clear();
        } else if !req.entries.is_empty() {
            progress.inflight = Some(req.last_index());
        }
        trace!(
            node_id = self.id,
            peer_id = peer,
            prev_log_index = req.prev_log_index,
            entries = req.entries.len(),
            "sending AppendEntries"
        );
        self.send(peer, RaftMessage::AppendEntries(req));
    }

    /// An AppendEntries to `peer` got no answer. The next heartbeat
    /// resends whatever it was carrying.
    pub fn replication_failed(&mut self, peer: NodeId) {
        if let Role::Leader(leader) = &mut self.role {
            if let Some(progress) = leader.progress.get_mut(&peer) {
                progress.inflight = None;
            }
        }
    }

    /// Queue an AppendEntries for every peer. Doubles as heartbeat and as
    /// the catch-up path for lagging followers.
    pub fn broadcast_heartbeat(&mut self) {
        if !self.is_leader() {
            return;
        }
        for peer in self.peers() {
            self.replicate_to(peer);
        }
    }

    /// Append a client command to the leader's log and start replicating it.
    /// Returns the index the command will commit at.
    pub fn submit_command(&mut self, command: Vec<u8>) -> Result<u64> {
        self.ensure_online()?;
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id(),
            });
        }
        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, command);
        let index = entry.index;
        self.persist_append(std::slice::from_ref(&entry))?;
        debug!(node_id = self.id, index, term = entry.term, "appended command to log");

        self.advance_commit_index();
        self.broadcast_heartbeat();
        Ok(index)
    }

    /// React to a follower's AppendEntries answer. Returns true if the
    /// commit index moved.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: &AppendEntriesResponse,
    ) -> Result<bool> {
        self.ensure_online()?;
        if resp.term > self.current_term {
            self.step_down(resp.term, None)?;
            return Ok(false);
        }
        if let Err(err) = self.check_term(resp.term) {
            debug!(node_id = self.id, peer_id = from, %err, "discarding AppendEntries response");
            return Ok(false);
        }
        let last_index = self.log.last_index();
        let Role::Leader(leader) = &mut self.role else {
            return Ok(false);
        };
        let Some(progress) = leader.progress.get_mut(&from) else {
            return Ok(false);
        };

        if resp.success {
            progress.match_index = progress.match_index.max(resp.match_index.min(last_index));
            progress.next_index = progress.match_index + 1;
            if matches!(progress.inflight, Some(sent) if progress.match_index >= sent) {
                progress.inflight = None;
            }
            let behind = progress.match_index < last_index && progress.inflight.is_none();

            let advanced = self.advance_commit_index();
            if behind {
                self.replicate_to(from);
            }
            Ok(advanced)
        } else {
            progress.inflight = None;
            let fallback = progress.next_index.saturating_sub(1);
            let hinted = resp.conflict_index.unwrap_or(fallback).min(fallback);
            progress.next_index = hinted.max(progress.match_index + 1).max(1);
            debug!(
                node_id = self.id,
                peer_id = from,
                next_index = progress.next_index,
                "follower log mismatch, backing off"
            );
            self.replicate_to(from);
            Ok(false)
        }
    }

    /// Move the commit index to the highest index stored on a majority,
    /// provided that entry belongs to the current term.
    fn advance_commit_index(&mut self) -> bool {
        let Role::Leader(leader) = &self.role else {
            return false;
        };
        let mut matched: Vec<u64> = leader.progress.values().map(|p| p.match_index).collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum_size() - 1];
        if candidate <= self.commit_index {
            return false;
        }
        // older-term entries only commit underneath a current-term one
        if self.log.term_at(candidate) != Some(self.current_term) {
            trace!(
                node_id = self.id,
                index = candidate,
                "majority reached on a prior-term entry, waiting"
            );
            return false;
        }
        debug!(node_id = self.id, commit_index = candidate, "advanced commit index");
        self.commit_index = candidate;
        self.apply_committed();
        true
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get_entry(index) else {
                warn!(node_id = self.id, index, "committed entry missing from log");
                return;
            };
            let result = self.state_machine.apply(index, &entry.command);
            self.applied.push(AppliedEntry {
                index,
                term: entry.term,
                result,
            });
            self.last_applied = index;
        }
    }

    // -- replication, follower side --

    fn check_consistency(&self, prev_log_index: u64, prev_log_term: Term) -> Result<()> {
        match self.log.term_at(prev_log_index) {
            Some(term) if term == prev_log_term => Ok(()),
            _ => Err(RaftError::LogInconsistency {
                prev_log_index,
                prev_log_term,
            }),
        }
    }

    fn append_response(&self, success: bool, match_index: u64, conflict_index: Option<u64>) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            conflict_index,
        }
    }

    /// Answer an AppendEntries. The bool says whether the election timer
    /// should be reset (true whenever the sender is the current leader).
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool)> {
        self.ensure_online()?;
        if let Err(err) = self.check_term(req.term) {
            debug!(node_id = self.id, leader = req.leader_id, %err, "rejecting AppendEntries");
            return Ok((self.append_response(false, 0, None), false));
        }
        if self.is_leader() && req.term == self.current_term {
            error!(
                node_id = self.id,
                other = req.leader_id,
                term = req.term,
                "two leaders in one term"
            );
        }
        self.step_down(req.term, Some(req.leader_id))?;

        if let Err(err) = self.check_consistency(req.prev_log_index, req.prev_log_term) {
            let conflict_index = if req.prev_log_index > self.log.last_index() {
                self.log.last_index() + 1
            } else {
                self.log.first_index_of_term(req.prev_log_index)
            };
            debug!(node_id = self.id, %err, conflict_index, "AppendEntries consistency check failed");
            return Ok((self.append_response(false, 0, Some(conflict_index)), true));
        }

        // skip what we already hold, cut at the first conflict, append the rest
        let mut first_new = req.entries.len();
        for (i, entry) in req.entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        error!(
                            node_id = self.id,
                            index = entry.index,
                            commit_index = self.commit_index,
                            "leader tried to overwrite a committed entry"
                        );
                        return Ok((self.append_response(false, 0, None), true));
                    }
                    debug!(node_id = self.id, from_index = entry.index, "truncating conflicting tail");
                    self.persist_truncate(entry.index)?;
                    first_new = i;
                    break;
                }
                None => {
                    first_new = i;
                    break;
                }
            }
        }
        if first_new < req.entries.len() {
            self.persist_append(&req.entries[first_new..])?;
            debug!(
                node_id = self.id,
                entries_appended = req.entries.len() - first_new,
                new_last_index = self.log.last_index(),
                "appended entries"
            );
        }

        let match_index = req.last_index();
        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(match_index);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                self.apply_committed();
            }
        }

        Ok((self.append_response(true, match_index, None), true))
    }
}

impl<S: Storage, M: StateMachine> std::fmt::Debug for RaftNode<S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("last_log_index", &self.log.last_index())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("offline", &self.offline)
            .finish()
    }
}
