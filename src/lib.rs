//! Arbor: the node storage engine of an embedded, real-time, hierarchical
//! key-tree database.
//!
//! Values (objects, arrays, strings, numbers, booleans, dates, bigints,
//! binary blobs and path references) are stored as fixed-size records in a
//! single binary file with its own space allocator, key interning table,
//! per-path async locking and a B+Tree child index for large collections.

#![warn(missing_docs)]

pub mod error;
pub mod locker;
pub mod path;
pub mod storage;
pub mod types;

pub use error::{ArborError, Result};
pub use locker::{NodeLock, NodeLocker, TransactionId};
pub use path::{PathInfo, PathKey};
pub use storage::engine::{
    ChildSummary, EngineStatsSnapshot, NodeInfo, RepairOptions, StorageEngine,
};
pub use storage::options::EngineOptions;
pub use storage::reader::ReadOptions;
pub use types::{PathReference, Value, ValueType};
