//! # storage
//!
//! why: the durability contract a node needs before it answers any rpc
//! relations: called by node.rs ahead of every in-memory mutation; FileStorage lives in raft-storage
//! what: Storage trait, InMemoryStorage with write-failure injection

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{LogEntry, NodeId, Term};

/// trait for durable storage of raft state
///
/// every method must be atomic: when it returns `Ok` the change is durable,
/// when it returns `Err` (or the process dies mid-call) the previously
/// persisted value is still what a later load observes.
pub trait Storage {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)>;

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// truncate log from given index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// clear all persisted state
    fn clear(&mut self) -> io::Result<()>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        (**self).save_term_and_vote(term, voted_for)
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        (**self).load_term_and_vote()
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        (**self).append_entries(entries)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        (**self).load_log()
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        (**self).truncate_log_from(from_index)
    }

    fn clear(&mut self) -> io::Result<()> {
        (**self).clear()
    }
}

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across process restarts.
/// writes can be made to fail through a shared switch to exercise the
/// node's offline path.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that makes every subsequent write fail while set.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        self.fail_writes.clone()
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        Ok(())
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        self.check_writable()?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.check_writable()?;
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.check_writable()?;
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.check_writable()?;
        self.term = 0;
        self.voted_for = None;
        self.log.clear();
        Ok(())
    }
}
