//! Binary node storage: on-disk format, allocation, serialization and the
//! engine facade.

/// Record addressing and allocation ranges.
pub mod address;

/// Bounded cache of resolved node descriptors.
pub mod cache;

/// Record header and chunk table codec.
pub mod chunk;

/// Binary value codec (tiny / inline / external-record forms).
pub mod codec;

/// Storage engine facade and node operations.
pub mod engine;

/// Free Space Table.
pub mod fst;

/// Key Index Table.
pub mod kit;

/// Serialized in-node B+Tree key index.
pub mod keytree;

/// Engine configuration options.
pub mod options;

/// Node reader.
pub mod reader;

/// Low-level paged file access.
pub mod file;

/// File header region and root pointer.
pub mod header;

pub(crate) mod writer;

pub use engine::StorageEngine;
pub use options::EngineOptions;
