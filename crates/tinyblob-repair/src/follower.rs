//! Follower side of the repair protocol
//!
//! A [`RepairEngine`] wraps the local blob store and the injected
//! connection pool. It fetches peer watermarks, streams missing objects
//! from a source of truth into the local store, and reconciles deletes
//! the leader has published.

use std::sync::Arc;
use tinyblob_common::types::{FileInfo, ObjectRecord, RECORD_SIZE};
use tinyblob_common::{Error, Result, crc32};
use tinyblob_store::BlobStore;
use tracing::{debug, info, warn};

use crate::task::{MemberFileMetas, RepairTask};
use crate::transport::{Connection, ConnectionPool, Packet, PacketOp, READ_DEADLINE};

/// Repair worker bound to one local store
pub struct RepairEngine {
    store: Arc<BlobStore>,
    pool: Arc<dyn ConnectionPool>,
}

impl RepairEngine {
    /// Create an engine over the local store and a connection pool
    pub fn new(store: Arc<BlobStore>, pool: Arc<dyn ConnectionPool>) -> Self {
        Self { store, pool }
    }

    /// The local store
    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    /// Local watermarks for the given chunk ids
    pub fn local_file_metas(&self, addr: &str, filter: &[u32]) -> MemberFileMetas {
        let mut metas = MemberFileMetas::new(addr);
        for info in self.store.all_watermarks() {
            if filter.contains(&info.file_id) {
                metas.files.insert(info.file_id, info);
            }
        }
        metas
    }

    /// A peer's watermarks for the given chunk ids
    ///
    /// Only the filtered ids make it into the returned map.
    pub fn remote_file_metas(&self, addr: &str, filter: &[u32]) -> Result<MemberFileMetas> {
        let mut conn = self.pool.get(addr)?;
        match fetch_watermarks(conn.as_mut()) {
            Ok(all) => {
                self.pool.put(conn, false);
                let mut metas = MemberFileMetas::new(addr);
                for info in all {
                    if filter.contains(&info.file_id) {
                        metas.files.insert(info.file_id, info);
                    }
                }
                Ok(metas)
            }
            Err(e) => {
                self.pool.put(conn, true);
                Err(e)
            }
        }
    }

    /// Stream missing objects for one chunk from its source of truth
    ///
    /// `remote` names the source replica and its watermark. Packets are
    /// applied as they arrive until the local watermark catches up.
    pub fn stream_repair(&self, remote: &FileInfo) -> Result<()> {
        let local = self.store.get_watermark(remote.file_id)?;
        let task = RepairTask {
            file_id: remote.file_id,
            start_obj: local.size + 1,
            end_obj: remote.size,
        };
        info!(?task, source = %remote.source, "starting chunk repair stream");

        let body =
            serde_json::to_vec(&task).map_err(|e| Error::Serialization(e.to_string()))?;
        let request = Packet::new(PacketOp::RepairRead, remote.file_id, 0, body.into());

        let mut conn = self.pool.get(&remote.source)?;
        match self.stream_repair_loop(conn.as_mut(), remote, &request) {
            Ok(()) => {
                self.pool.put(conn, false);
                Ok(())
            }
            Err(e) => {
                warn!(file_id = remote.file_id, error = %e, "chunk repair stream failed");
                self.pool.put(conn, true);
                Err(e)
            }
        }
    }

    fn stream_repair_loop(
        &self,
        conn: &mut dyn Connection,
        remote: &FileInfo,
        request: &Packet,
    ) -> Result<()> {
        conn.write_packet(request)?;

        loop {
            let local = self.store.get_watermark(remote.file_id)?;
            if local.size >= remote.size {
                return Ok(());
            }

            let packet = conn.read_packet(READ_DEADLINE)?;
            let new_last = packet.offset;
            if new_last > remote.size {
                return Err(Error::protocol(format!(
                    "repair packet carries oid {new_last} beyond the source watermark {}",
                    remote.size
                )));
            }

            debug!(
                file_id = remote.file_id,
                new_last,
                size = packet.data.len(),
                "applying repair data packet"
            );
            self.apply_repair_objects(remote.file_id, &packet.data, new_last)?;
        }
    }

    /// Apply one repair data packet to the local store
    ///
    /// Walks `data` as packed `(header, payload?)` pairs. Tombstone
    /// headers carry no payload and are recorded as delete dentries;
    /// live objects are CRC-checked before being written. Stops once
    /// the applied oid reaches `end_oid` or too few bytes remain for a
    /// complete pair.
    pub fn apply_repair_objects(&self, file_id: u32, data: &[u8], end_oid: u64) -> Result<()> {
        let mut pos = 0usize;
        let mut applied = 0u64;

        while pos + RECORD_SIZE <= data.len() && applied < end_oid {
            let header = ObjectRecord::from_bytes(&data[pos..pos + RECORD_SIZE])?;
            pos += RECORD_SIZE;

            if header.is_tombstone() {
                self.store
                    .write_delete_dentry(file_id, header.oid, header.crc)?;
                applied = header.oid;
                continue;
            }

            let size = header.size as usize;
            if pos + size > data.len() {
                return Err(Error::protocol(format!(
                    "object {} is missing its body: expected {} bytes, have {}",
                    header.oid,
                    size,
                    data.len() - pos
                )));
            }
            let payload = &data[pos..pos + size];
            pos += size;

            let actual = crc32(payload);
            if actual != header.crc {
                return Err(Error::CrcMismatch {
                    expected: header.crc,
                    actual,
                });
            }

            self.store
                .write(file_id, header.oid, header.size, payload, header.crc)?;
            applied = header.oid;
        }
        Ok(())
    }

    /// Reconcile deletes the leader has published for one chunk
    ///
    /// Fetches the tombstoned oids from `task.source` and tombstones
    /// them locally.
    pub fn apply_delete_task(&self, task: &FileInfo) -> Result<()> {
        let mut conn = self.pool.get(&task.source)?;
        match fetch_del_objects(conn.as_mut(), task.file_id) {
            Ok(oids) => {
                self.pool.put(conn, false);
                info!(file_id = task.file_id, count = oids.len(), "applying peer deletes");
                self.store.apply_del_objects(task.file_id, &oids)
            }
            Err(e) => {
                self.pool.put(conn, true);
                Err(e)
            }
        }
    }
}

fn fetch_watermarks(conn: &mut dyn Connection) -> Result<Vec<FileInfo>> {
    conn.write_packet(&Packet::request(PacketOp::GetWatermarks, 0))?;
    let resp = conn.read_packet(READ_DEADLINE)?;
    serde_json::from_slice(&resp.data).map_err(|e| Error::Serialization(e.to_string()))
}

fn fetch_del_objects(conn: &mut dyn Connection, file_id: u32) -> Result<Vec<u64>> {
    conn.write_packet(&Packet::request(PacketOp::GetDelObjects, file_id))?;
    let resp = conn.read_packet(READ_DEADLINE)?;
    serde_json::from_slice(&resp.data).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::sync_data;
    use crate::task::generate_repair_tasks;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Pool whose connections answer from an in-process leader store
    struct LoopbackPool {
        leader: Arc<BlobStore>,
    }

    impl ConnectionPool for LoopbackPool {
        fn get(&self, _addr: &str) -> Result<Box<dyn Connection>> {
            Ok(Box::new(LoopbackConn {
                leader: Arc::clone(&self.leader),
                responses: VecDeque::new(),
            }))
        }

        fn put(&self, _conn: Box<dyn Connection>, _broken: bool) {}
    }

    struct LoopbackConn {
        leader: Arc<BlobStore>,
        responses: VecDeque<Packet>,
    }

    impl Connection for LoopbackConn {
        fn write_packet(&mut self, packet: &Packet) -> Result<()> {
            match packet.op {
                PacketOp::GetWatermarks => {
                    let body = serde_json::to_vec(&self.leader.all_watermarks())
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    self.responses
                        .push_back(Packet::new(PacketOp::GetWatermarks, 0, 0, body.into()));
                }
                PacketOp::GetDelObjects => {
                    let oids = self.leader.get_del_objects(packet.file_id)?;
                    let body = serde_json::to_vec(&oids)
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    self.responses.push_back(Packet::new(
                        PacketOp::GetDelObjects,
                        packet.file_id,
                        0,
                        body.into(),
                    ));
                }
                PacketOp::RepairRead => {
                    let task: RepairTask = serde_json::from_slice(&packet.data)
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    let mut sink = QueueSink(&mut self.responses);
                    sync_data(
                        &self.leader,
                        task.file_id,
                        task.start_obj,
                        task.end_obj,
                        &mut sink,
                    )?;
                }
                PacketOp::Data => {
                    return Err(Error::protocol("unexpected data packet from follower"));
                }
            }
            Ok(())
        }

        fn read_packet(&mut self, _deadline: Duration) -> Result<Packet> {
            self.responses
                .pop_front()
                .ok_or_else(|| Error::protocol("no pending response"))
        }
    }

    struct QueueSink<'a>(&'a mut VecDeque<Packet>);

    impl Connection for QueueSink<'_> {
        fn write_packet(&mut self, packet: &Packet) -> Result<()> {
            self.0.push_back(packet.clone());
            Ok(())
        }

        fn read_packet(&mut self, _deadline: Duration) -> Result<Packet> {
            unreachable!("sink connections are write-only")
        }
    }

    fn payload(oid: u64) -> Vec<u8> {
        format!("object-{oid:04}").into_bytes()
    }

    fn engine_pair() -> (tempfile::TempDir, Arc<BlobStore>, RepairEngine) {
        let dir = tempdir().unwrap();
        let leader = Arc::new(BlobStore::new(dir.path().join("leader"), 1000).unwrap());
        let follower = Arc::new(BlobStore::new(dir.path().join("follower"), 1000).unwrap());
        let pool = Arc::new(LoopbackPool {
            leader: Arc::clone(&leader),
        });
        (dir, leader, RepairEngine::new(follower, pool))
    }

    #[test]
    fn test_repair_convergence() {
        let (_dir, leader, engine) = engine_pair();

        for oid in 1..=10u64 {
            let body = payload(oid);
            leader
                .write(1, oid, body.len() as u32, &body, crc32(&body))
                .unwrap();
        }
        leader.mark_delete(1, 3).unwrap();

        let follower = Arc::clone(engine.store());
        for oid in 1..=5u64 {
            let body = payload(oid);
            follower
                .write(1, oid, body.len() as u32, &body, crc32(&body))
                .unwrap();
        }

        let remote = FileInfo {
            file_id: 1,
            size: 10,
            source: "leader:9021".into(),
        };
        engine.stream_repair(&remote).unwrap();

        assert_eq!(follower.last_oid(1).unwrap(), 10);
        for oid in 6..=10u64 {
            let expect = payload(oid);
            let mut buf = vec![0u8; expect.len()];
            let crc = follower
                .read(1, oid, expect.len() as u32, &mut buf)
                .unwrap();
            assert_eq!(buf, expect);
            assert_eq!(crc, crc32(&expect));
        }

        // the delete of oid 3 propagates separately
        engine
            .apply_delete_task(&FileInfo {
                file_id: 1,
                size: 0,
                source: "leader:9021".into(),
            })
            .unwrap();
        let mut buf = vec![0u8; payload(3).len()];
        assert!(matches!(
            follower.read(1, 3, buf.len() as u32, &mut buf),
            Err(Error::ObjectNotFound)
        ));
    }

    #[test]
    fn test_stream_carries_tombstones_in_range() {
        let (_dir, leader, engine) = engine_pair();

        for oid in 1..=6u64 {
            let body = payload(oid);
            leader
                .write(1, oid, body.len() as u32, &body, crc32(&body))
                .unwrap();
        }
        leader.mark_delete(1, 5).unwrap();

        let remote = FileInfo {
            file_id: 1,
            size: 6,
            source: "leader:9021".into(),
        };
        engine.stream_repair(&remote).unwrap();

        let follower = engine.store();
        assert_eq!(follower.last_oid(1).unwrap(), 6);
        // the in-range tombstone arrived as a delete dentry
        let dels = follower.get_del_objects(1).unwrap();
        assert_eq!(dels, vec![5]);
    }

    #[test]
    fn test_apply_rejects_corrupt_payload() {
        let (_dir, _leader, engine) = engine_pair();

        let body = payload(1);
        let header = ObjectRecord::new(1, 0, body.len() as u32, crc32(&body));
        let mut data = header.to_bytes().to_vec();
        data.extend_from_slice(&body);
        // flip one payload byte
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        assert!(matches!(
            engine.apply_repair_objects(1, &data, 1),
            Err(Error::CrcMismatch { .. })
        ));
        assert_eq!(engine.store().last_oid(1).unwrap(), 0);
    }

    #[test]
    fn test_apply_stops_at_end_oid() {
        let (_dir, _leader, engine) = engine_pair();

        let mut data = Vec::new();
        for oid in 1..=3u64 {
            let body = payload(oid);
            data.extend_from_slice(
                &ObjectRecord::new(oid, 0, body.len() as u32, crc32(&body)).to_bytes(),
            );
            data.extend_from_slice(&body);
        }

        engine.apply_repair_objects(1, &data, 2).unwrap();
        assert_eq!(engine.store().last_oid(1).unwrap(), 2);
    }

    #[test]
    fn test_apply_partial_header_stops_silently() {
        let (_dir, _leader, engine) = engine_pair();

        let body = payload(1);
        let mut data = ObjectRecord::new(1, 0, body.len() as u32, crc32(&body))
            .to_bytes()
            .to_vec();
        data.extend_from_slice(&body);
        // a torn trailing header is not a complete pair
        data.extend_from_slice(&[0u8; RECORD_SIZE - 1]);

        engine.apply_repair_objects(1, &data, 9).unwrap();
        assert_eq!(engine.store().last_oid(1).unwrap(), 1);
    }

    #[test]
    fn test_apply_missing_body_is_an_error() {
        let (_dir, _leader, engine) = engine_pair();

        let body = payload(1);
        let mut data = ObjectRecord::new(1, 0, body.len() as u32, crc32(&body))
            .to_bytes()
            .to_vec();
        data.extend_from_slice(&body);
        // a second header with most of its body missing
        data.extend_from_slice(
            &ObjectRecord::new(2, 0, body.len() as u32, crc32(&body)).to_bytes(),
        );
        data.push(b'x');

        assert!(engine.apply_repair_objects(1, &data, 9).is_err());
        // the complete first pair was applied before the failure
        assert_eq!(engine.store().last_oid(1).unwrap(), 1);
    }

    /// Leader that answers every read with an oid beyond any watermark
    struct OversizedPool;

    impl ConnectionPool for OversizedPool {
        fn get(&self, _addr: &str) -> Result<Box<dyn Connection>> {
            Ok(Box::new(OversizedConn))
        }

        fn put(&self, _conn: Box<dyn Connection>, _broken: bool) {}
    }

    struct OversizedConn;

    impl Connection for OversizedConn {
        fn write_packet(&mut self, _packet: &Packet) -> Result<()> {
            Ok(())
        }

        fn read_packet(&mut self, _deadline: Duration) -> Result<Packet> {
            Ok(Packet::new(PacketOp::Data, 1, 99, Bytes::new()))
        }
    }

    #[test]
    fn test_stream_rejects_packet_beyond_watermark() {
        let dir = tempdir().unwrap();
        let follower = Arc::new(BlobStore::new(dir.path().join("follower"), 1000).unwrap());
        let engine = RepairEngine::new(follower, Arc::new(OversizedPool));

        let remote = FileInfo {
            file_id: 1,
            size: 3,
            source: "leader:9021".into(),
        };
        let err = engine.stream_repair(&remote).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_remote_file_metas_filters_ids() {
        let (_dir, leader, engine) = engine_pair();
        leader.write(2, 1, 2, b"ab", crc32(b"ab")).unwrap();

        let metas = engine
            .remote_file_metas("leader:9021", &[1, 2])
            .unwrap();
        assert_eq!(metas.files.len(), 2);
        assert_eq!(metas.files[&2].size, 1);
        assert!(!metas.files.contains_key(&3));
    }

    #[test]
    fn test_full_round_with_task_generation() {
        let (_dir, leader, engine) = engine_pair();

        for oid in 1..=8u64 {
            let body = payload(oid);
            leader
                .write(2, oid, body.len() as u32, &body, crc32(&body))
                .unwrap();
        }
        leader.mark_delete(2, 1).unwrap();

        let follower = Arc::clone(engine.store());
        for oid in 1..=4u64 {
            let body = payload(oid);
            follower
                .write(2, oid, body.len() as u32, &body, crc32(&body))
                .unwrap();
        }

        let filter: Vec<u32> = (1..=10).collect();
        let mut members = vec![
            RepairEngine::new(Arc::clone(&leader), Arc::new(LoopbackPool {
                leader: Arc::clone(&leader),
            }))
            .local_file_metas("leader:9021", &filter),
            engine.local_file_metas("follower:9021", &filter),
        ];
        generate_repair_tasks(&leader, &mut members).unwrap();

        assert_eq!(members[1].need_fix.len(), 1);
        assert_eq!(members[1].need_fix[0].file_id, 2);
        assert_eq!(members[1].need_fix[0].size, 8);
        assert_eq!(members[1].need_delete.len(), 1);

        for fix in members[1].need_fix.clone() {
            engine.stream_repair(&fix).unwrap();
        }
        for del in members[1].need_delete.clone() {
            engine.apply_delete_task(&del).unwrap();
        }

        assert_eq!(follower.last_oid(2).unwrap(), 8);
        let mut buf = vec![0u8; payload(1).len()];
        assert!(matches!(
            follower.read(2, 1, buf.len() as u32, &mut buf),
            Err(Error::ObjectNotFound)
        ));
        let expect = payload(8);
        let mut buf = vec![0u8; expect.len()];
        follower.read(2, 8, expect.len() as u32, &mut buf).unwrap();
        assert_eq!(buf, expect);
    }
}
