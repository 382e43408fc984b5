//! Tinyblob Store - Small-object append-only blob store
//!
//! This crate implements the on-disk engine for a tiny-file data
//! partition:
//! - Per-chunk append log and index pair with reboot replay
//! - Fixed set of chunks with writable/not-writable admission queues
//! - Tombstone-style deletes
//! - Compaction that rewrites a chunk to drop dead regions

pub mod chunk;
pub mod compact;
pub mod index;
pub mod store;

// Re-exports
pub use chunk::Chunk;
pub use index::{IndexTree, walk_index_file};
pub use store::BlobStore;
