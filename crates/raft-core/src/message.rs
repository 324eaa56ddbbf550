//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by raft-runtime transports
//! what: VoteRequest/Response, AppendEntriesRequest/Response, the RaftMessage envelope

use serde::{Deserialize, Serialize};

use crate::{LogEntry, NodeId, Term};

/// RequestVote arguments; also used for the pre-vote round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// Index of the last entry this request covers.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success, the last index now known to match the leader
    pub match_index: u64,
    /// On a consistency failure, where the leader should resume sending
    pub conflict_index: Option<u64>,
}

/// Every message a node exchanges with its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    PreVoteRequest(VoteRequest),
    PreVoteResponse(VoteResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::PreVoteRequest(req) | RaftMessage::VoteRequest(req) => req.term,
            RaftMessage::PreVoteResponse(resp) | RaftMessage::VoteResponse(resp) => resp.term,
            RaftMessage::AppendEntries(req) => req.term,
            RaftMessage::AppendEntriesResponse(resp) => resp.term,
        }
    }
}

/// An outbound request addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}
