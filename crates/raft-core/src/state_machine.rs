//! # state_machine
//!
//! why: the application side of raft, fed committed commands in order
//! relations: driven by node.rs once entries commit
//! what: StateMachine trait, MemoryStateMachine recorder

/// Application state replicated by the cluster.
///
/// The node calls `apply` exactly once per committed index, in index order,
/// and never for an entry that could still be truncated.
pub trait StateMachine {
    /// Apply one committed command, returning the result handed back to
    /// the client that submitted it.
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8>;
}

/// Records every applied command; useful for tests and as a demo backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateMachine {
    applied: Vec<(u64, Vec<u8>)>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands in the order they were applied, with their indexes.
    pub fn applied(&self) -> &[(u64, Vec<u8>)] {
        &self.applied
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.applied.iter().map(|(_, c)| c.clone()).collect()
    }
}

impl StateMachine for MemoryStateMachine {
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8> {
        debug_assert_eq!(
            index,
            self.applied.last().map(|(i, _)| i + 1).unwrap_or(1),
            "entries must be applied in order"
        );
        self.applied.push((index, command.to_vec()));
        index.to_le_bytes().to_vec()
    }
}
