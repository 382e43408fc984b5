//! Core type definitions for the tinyblob engine
//!
//! This module defines the on-disk index entry, the watermark exchanged
//! between replicas and the per-chunk snapshot descriptor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Sentinel `size` marking an index entry as a tombstone
///
/// A tombstone entry has no payload at its offset; the `offset` field is
/// preserved on disk but undefined.
pub const TOMBSTONE: u32 = u32::MAX;

/// Serialized width of one index entry in bytes
pub const RECORD_SIZE: usize = 20;

/// One index entry: the location of an object within its chunk
///
/// On-disk layout (big-endian, fixed width):
///
/// ```text
/// +--------+--------+------+------+
/// | Oid    | Offset | Size | Crc  |
/// | 8B     | 4B     | 4B   | 4B   |
/// +--------+--------+------+------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Object id, unique within the chunk and monotone when appended
    pub oid: u64,
    /// Byte offset of the payload within the chunk data file
    pub offset: u32,
    /// Payload length in bytes, or [`TOMBSTONE`]
    pub size: u32,
    /// IEEE CRC32 of the payload; undefined for tombstones
    pub crc: u32,
}

impl ObjectRecord {
    /// Create a new live record
    #[must_use]
    pub const fn new(oid: u64, offset: u32, size: u32, crc: u32) -> Self {
        Self {
            oid,
            offset,
            size,
            crc,
        }
    }

    /// Create a tombstone record for `oid`
    #[must_use]
    pub const fn tombstone(oid: u64, offset: u32, crc: u32) -> Self {
        Self {
            oid,
            offset,
            size: TOMBSTONE,
            crc,
        }
    }

    /// Check whether this record marks a deleted object
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.size == TOMBSTONE
    }

    /// Serialize to the fixed 20-byte layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.oid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_be_bytes());
        buf[12..16].copy_from_slice(&self.size.to_be_bytes());
        buf[16..20].copy_from_slice(&self.crc.to_be_bytes());
        buf
    }

    /// Parse a record from the fixed 20-byte layout
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_SIZE {
            return Err(Error::protocol(format!(
                "index entry too small: {} bytes",
                buf.len()
            )));
        }

        Ok(Self {
            oid: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            offset: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            size: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            crc: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// Watermark of one chunk on one replica
///
/// `size` carries the chunk's last object id. `source` names the replica
/// to stream from when this entry describes a repair target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: u32,
    pub size: u64,
    #[serde(default)]
    pub source: String,
}

impl FileInfo {
    /// Create a watermark with no source replica
    #[must_use]
    pub fn new(file_id: u32, size: u64) -> Self {
        Self {
            file_id,
            size,
            source: String::new(),
        }
    }
}

/// One chunk's entry in a store snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Chunk file name within the data directory
    pub name: String,
    /// Aggregate CRC over the chunk's live records
    pub crc: u32,
    /// Data file modification time, seconds since the epoch
    pub modified: i64,
    pub mark_del: bool,
    pub last_obj_id: u64,
    /// Count of live records in the chunk
    pub needle_cnt: u64,
}
