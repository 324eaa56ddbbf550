//! # error
//!
//! why: name the ways an on-disk raft log can be unusable
//! relations: produced by file.rs, surfaced to raft-core as io::Error
//! what: StorageError and its io::Error conversion

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("corrupt log record at line {line} of {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("log record out of order in {}: expected index {expected}, found {found}", path.display())]
    OutOfOrder {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("append must continue at index {expected}, got {found}")]
    NonContiguousAppend { expected: u64, found: u64 },

    #[error("invalid metadata in {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<StorageError> for io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(err) => err,
            StorageError::NonContiguousAppend { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
