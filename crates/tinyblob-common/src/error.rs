//! Error types for the tinyblob engine
//!
//! This module defines the error kinds surfaced by the engine. Errors are
//! reported, never retried internally; [`Error::Again`] invites the caller
//! to retry later, and [`Error::Commit`] is fatal for the affected chunk.

use thiserror::Error;

/// Common result type for tinyblob operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the tinyblob engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("chunk not found: {0}")]
    ChunkNotFound(u32),

    #[error("object not found")]
    ObjectNotFound,

    #[error("read parameters disagree with the index entry")]
    ParamMismatch,

    #[error("object id {oid} is not above the chunk watermark {last_oid}")]
    ObjectSmaller { oid: u64, last_oid: u64 },

    #[error("chunk is busy compacting, try again")]
    Again,

    #[error("no available chunk")]
    NoAvailableChunk,

    #[error("no unavailable chunk")]
    NoUnavailableChunk,

    #[error("compaction rebuild failed: {0}")]
    Compaction(String),

    #[error("compaction commit failed: {0}")]
    Commit(String),

    #[error("crc mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Check if this error invites a later retry
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Again)
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ChunkNotFound(_) | Self::ObjectNotFound)
    }

    /// Check if this error leaves the chunk unusable
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Commit(_))
    }
}
