//! Transport seam for the repair protocol
//!
//! The engine never frames bytes on a socket itself. It speaks in
//! logical [`Packet`]s over a [`Connection`] checked out of an injected
//! [`ConnectionPool`]; the pool is process-wide state owned by the
//! embedding node, handed in explicitly.

use bytes::Bytes;
use std::time::Duration;
use tinyblob_common::{Result, crc32};

/// Deadline for reading one response packet
pub const READ_DEADLINE: Duration = Duration::from_secs(10);

/// Target size of one repair data packet
pub const PACKET_TARGET: usize = 10 * 1024 * 1024;

/// Hard cap on one repair data packet
pub const PACKET_LIMIT: usize = 15 * 1024 * 1024;

/// Logical operation a packet carries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketOp {
    /// Request the remote store's per-chunk watermarks
    GetWatermarks,
    /// Request the remote chunk's published tombstone oids
    GetDelObjects,
    /// Open a streaming repair read; the body is a JSON repair task
    RepairRead,
    /// One slice of repair data; `offset` is the last oid included
    Data,
}

/// Logical fields of one repair protocol message
#[derive(Clone, Debug)]
pub struct Packet {
    pub op: PacketOp,
    /// Chunk the message concerns
    pub file_id: u32,
    /// For [`PacketOp::Data`]: the last oid included in `data`
    pub offset: u64,
    /// IEEE CRC32 of `data`
    pub crc: u32,
    pub data: Bytes,
}

impl Packet {
    /// Build a packet, checksumming its payload
    #[must_use]
    pub fn new(op: PacketOp, file_id: u32, offset: u64, data: Bytes) -> Self {
        let crc = crc32(&data);
        Self {
            op,
            file_id,
            offset,
            crc,
            data,
        }
    }

    /// Build a bodyless request packet
    #[must_use]
    pub fn request(op: PacketOp, file_id: u32) -> Self {
        Self::new(op, file_id, 0, Bytes::new())
    }
}

/// One checked-out connection to a peer replica
pub trait Connection: Send {
    /// Send one packet
    fn write_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Receive one packet, failing once `deadline` elapses
    fn read_packet(&mut self, deadline: Duration) -> Result<Packet>;
}

/// Process-wide pool of peer connections, injected into the engine
pub trait ConnectionPool: Send + Sync {
    /// Check a connection out for `addr`
    fn get(&self, addr: &str) -> Result<Box<dyn Connection>>;

    /// Return a connection; `broken` discards it instead of pooling it
    fn put(&self, conn: Box<dyn Connection>, broken: bool);
}
