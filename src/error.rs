//! Error types shared across the engine.

use std::io;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors produced by the storage engine.
#[derive(Debug, Error)]
pub enum ArborError {
    /// I/O error from the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk state that cannot be interpreted. Never auto-repaired.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// The addressed node does not exist. Recoverable for callers that
    /// translate it to "no children" / "does not exist".
    #[error("node at \"{0}\" does not exist")]
    NodeNotFound(String),
    /// A size exceeded one of the protocol-fixed bit widths.
    #[error("allocation limit exceeded: {0}")]
    AllocationLimit(String),
    /// A merge would create a gap in a stored array.
    #[error(
        "cannot insert or delete beyond the tail of array \"{path}\" (index {index}); \
         rewrite the array or use an object collection instead"
    )]
    SparseArray {
        /// Path of the array node.
        path: String,
        /// Offending index.
        index: usize,
    },
    /// A lock could not be acquired, or was used after release/expiry.
    #[error("lock error on \"{path}\": {reason}")]
    Lock {
        /// Path the lock was requested or held on.
        path: String,
        /// Human-readable cause.
        reason: String,
    },
    /// Internal signal raised by the key index tree when a leaf cannot take
    /// another entry. Recovered by growing or rebuilding the tree.
    #[error("key index tree is full")]
    TreeFull,
    /// Persistence of critical metadata (KIT, root pointer) failed; in-memory
    /// and on-disk state may have diverged.
    #[error("critical metadata write failed: {0}")]
    Critical(String),
    /// Invariant violation that should be impossible; indicates a bug.
    #[error("internal consistency error: {0}")]
    Internal(String),
    /// Caller supplied an argument the engine cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A value could not be serialized into the binary format.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ArborError {
    /// Wraps a read failure with the path it occurred on.
    pub fn with_path(self, path: &str) -> Self {
        match self {
            ArborError::Corruption(msg) => ArborError::Corruption(format!("at \"{path}\": {msg}")),
            other => other,
        }
    }
}
