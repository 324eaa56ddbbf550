//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, mirrored durably through storage.rs
//! what: LogEntry, RaftLog with positional lookups and the up-to-date check

use serde::{Deserialize, Serialize};

use crate::Term;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// In-memory view of a node's log.
///
/// Indexes are 1-based and contiguous; index 0 is the empty prefix with
/// term 0. The node keeps this in step with its `Storage`, writing to
/// storage first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from entries loaded out of storage.
    ///
    /// Stops at the first gap so a damaged tail can never produce a
    /// non-contiguous log.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut log = Self::new();
        for entry in entries {
            if entry.index != log.last_index() + 1 {
                tracing::warn!(
                    expected = log.last_index() + 1,
                    found = entry.index,
                    "discarding non-contiguous log tail"
                );
                break;
            }
            log.entries.push(entry);
        }
        log
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; `Some(0)` for the empty prefix.
    pub fn term_at(&self, index: u64) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Append entries that continue the log directly.
    ///
    /// # Panics
    /// Panics in debug builds if an entry does not follow the last index.
    pub fn append(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            debug_assert_eq!(entry.index, self.last_index() + 1, "log append must be contiguous");
            self.entries.push(entry.clone());
        }
    }

    /// Drop the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.saturating_sub(1) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
        }
    }

    /// Up to `max` entries starting at `start` (inclusive).
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries[(start - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// First index holding the same term as the entry at `index`.
    ///
    /// Used as the conflict hint so a leader can skip a whole term at once.
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return self.last_index() + 1;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Whether a log ending at (`last_index`, `last_term`) is at least as
    /// up-to-date as this one.
    pub fn is_up_to_date(&self, last_index: u64, last_term: Term) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }
}
