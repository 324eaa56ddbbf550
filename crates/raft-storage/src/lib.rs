//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's Storage trait; opened by raft-runtime when a data dir is configured
//! what: FileStorage (atomic meta file plus append-only entry log), storage errors

mod error;
mod file;

pub use error::StorageError;
pub use file::FileStorage;
pub use raft_core::{InMemoryStorage, Storage};
