//! Tinyblob Repair - Replica reconciliation for the blob store
//!
//! Replicas of a data partition drift when a follower misses appends or
//! deletes. This crate diffs per-chunk watermarks across the replica
//! set, streams missing objects from the replica holding the highest
//! watermark into lagging followers, and propagates tombstones published
//! by the leader.
//!
//! The byte-level transport is not this crate's concern: callers inject
//! a [`ConnectionPool`] and the engine exchanges logical [`Packet`]s
//! over it.

pub mod follower;
pub mod leader;
pub mod task;
pub mod transport;

pub use follower::RepairEngine;
pub use leader::sync_data;
pub use task::{MemberFileMetas, RepairTask, generate_repair_tasks};
pub use transport::{
    Connection, ConnectionPool, PACKET_LIMIT, PACKET_TARGET, Packet, PacketOp, READ_DEADLINE,
};
