//! Leader side of a streaming repair read
//!
//! Serves a follower's [`RepairTask`](crate::RepairTask): enumerates the
//! requested oid range and streams `(header, payload?)` pairs packed
//! into data packets. Tombstoned oids travel as bare headers so the
//! follower can record the delete.

use bytes::Bytes;
use tinyblob_common::types::RECORD_SIZE;
use tinyblob_common::Result;
use tinyblob_store::BlobStore;
use tracing::debug;

use crate::transport::{Connection, PACKET_LIMIT, PACKET_TARGET, Packet, PacketOp};

/// Stream the objects of `[start_oid, end_oid]` to a follower
///
/// Packets aim for the target size and never reach the hard cap: when
/// appending the next object would, whatever has accumulated is flushed
/// first, even if that is nothing (a single object can exceed the cap on
/// its own). The final packet is flushed unconditionally, and each
/// packet's `offset` names the last oid it carries.
pub fn sync_data(
    store: &BlobStore,
    file_id: u32,
    start_oid: u64,
    end_oid: u64,
    conn: &mut dyn Connection,
) -> Result<()> {
    sync_data_capped(store, file_id, start_oid, end_oid, conn, PACKET_LIMIT)
}

fn sync_data_capped(
    store: &BlobStore,
    file_id: u32,
    start_oid: u64,
    end_oid: u64,
    conn: &mut dyn Connection,
    cap: usize,
) -> Result<()> {
    let objects = store.objects_in_range(file_id, start_oid..=end_oid)?;
    debug!(file_id, start_oid, end_oid, count = objects.len(), "streaming repair read");

    let mut buf: Vec<u8> = Vec::with_capacity(PACKET_TARGET.min(cap));
    let mut last_oid = 0u64;

    for rec in &objects {
        let body_size = if rec.is_tombstone() {
            0
        } else {
            rec.size as usize
        };

        if buf.len() + RECORD_SIZE + body_size >= cap {
            post_repair_data(conn, file_id, last_oid, &mut buf)?;
        }

        buf.extend_from_slice(&rec.to_bytes());
        if body_size > 0 {
            let mut payload = vec![0u8; body_size];
            store.read(file_id, rec.oid, rec.size, &mut payload)?;
            buf.extend_from_slice(&payload);
        }
        last_oid = rec.oid;
    }

    post_repair_data(conn, file_id, last_oid, &mut buf)
}

/// Flush the accumulated buffer as one data packet
fn post_repair_data(
    conn: &mut dyn Connection,
    file_id: u32,
    last_oid: u64,
    buf: &mut Vec<u8>,
) -> Result<()> {
    let packet = Packet::new(
        PacketOp::Data,
        file_id,
        last_oid,
        Bytes::copy_from_slice(buf),
    );
    debug!(file_id, last_oid, size = buf.len(), "sending repair data packet");
    buf.clear();
    conn.write_packet(&packet)
}
