//! One chunk: an append-only data file paired with an object index
//!
//! A chunk serializes its callers through two locks. The compact lock is
//! held by every write, every index-mutating delete, and the whole of
//! compaction; user paths only try-acquire it and surface [`Error::Again`]
//! when compaction holds it. The commit lock is a reader-writer lock:
//! object reads take it shared, and only the commit phase of compaction
//! takes it exclusively to swap in the rewritten files.
//!
//! Reads and writes of the same oid are not ordered against each other
//! beyond the index contract: a write appends the payload before
//! publishing the index entry, so a read that sees the entry can always
//! reach the bytes.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::RangeInclusive;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tinyblob_common::types::{FileInfo, ObjectRecord, TOMBSTONE};
use tinyblob_common::{Error, Result};

use crate::index::IndexTree;

/// The state swapped out by a compaction commit
pub(crate) struct ChunkCore {
    pub(crate) data: File,
    pub(crate) tree: IndexTree,
}

/// One append-only data file plus its index
pub struct Chunk {
    pub(crate) id: u32,
    pub(crate) data_path: PathBuf,
    pub(crate) index_path: PathBuf,
    /// Watermark: highest oid appended so far
    pub(crate) last_oid: AtomicU64,
    /// Watermark snapshotted by the tombstone scan, for repair
    sync_last_oid: AtomicU64,
    /// Held by writes, index-mutating deletes and compaction
    pub(crate) compact_lock: Mutex<()>,
    /// Commit lock: shared for reads, exclusive for the compaction commit
    pub(crate) core: RwLock<ChunkCore>,
}

fn open_append(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

impl Chunk {
    /// Open chunk `id` under `dir`, replaying the index if rebooting
    ///
    /// The data file is `<dir>/<id>` and the index file `<dir>/<id>.idx`,
    /// both opened append-only. When the data file already exists the
    /// index file is replayed to rebuild the in-memory tree; a torn final
    /// index entry is discarded.
    pub fn open(dir: &Path, id: u32) -> Result<Self> {
        let data_path = dir.join(id.to_string());
        let index_path = dir.join(format!("{id}.idx"));

        let rebooting = data_path.exists();
        let data = open_append(&data_path)?;
        let idx_file = open_append(&index_path)?;

        let (tree, last_oid) = if rebooting {
            IndexTree::load(index_path.clone(), idx_file)?
        } else {
            (IndexTree::new(index_path.clone(), idx_file), 0)
        };

        Ok(Self {
            id,
            data_path,
            index_path,
            last_oid: AtomicU64::new(last_oid),
            sync_last_oid: AtomicU64::new(0),
            compact_lock: Mutex::new(()),
            core: RwLock::new(ChunkCore { data, tree }),
        })
    }

    /// Chunk id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current watermark
    pub fn last_oid(&self) -> u64 {
        self.last_oid.load(Ordering::SeqCst)
    }

    /// Watermark recorded by the latest tombstone scan
    pub fn sync_last_oid(&self) -> u64 {
        self.sync_last_oid.load(Ordering::SeqCst)
    }

    fn bump_last_oid(&self, oid: u64) {
        self.last_oid.fetch_max(oid, Ordering::SeqCst);
    }

    /// Append one object
    ///
    /// Appended oids must be strictly increasing: an oid at or below the
    /// watermark is rejected with [`Error::ObjectSmaller`]. Returns
    /// [`Error::Again`] while compaction holds the chunk.
    pub fn write(&self, oid: u64, size: u32, data: &[u8], crc: u32) -> Result<()> {
        let _guard = self.compact_lock.try_lock().ok_or(Error::Again)?;

        let last_oid = self.last_oid();
        if oid <= last_oid {
            return Err(Error::ObjectSmaller { oid, last_oid });
        }

        let core = self.core.read();
        let offset = core.data.metadata()?.len();
        (&core.data).write_all(&data[..size as usize])?;
        core.tree.set(oid, offset as u32, size, crc)?;
        self.bump_last_oid(oid);
        Ok(())
    }

    /// Append a tombstone index entry for `oid`
    ///
    /// Used when a peer reports the object deleted. Only the on-disk
    /// index entry is written; the running map is left alone, so the
    /// tombstone takes effect for lookups after the next replay. The
    /// recorded offset is the current data-file size; no payload is
    /// written and the field is undefined for tombstones.
    pub fn write_delete_dentry(&self, oid: u64, crc: u32) -> Result<()> {
        let _guard = self.compact_lock.try_lock().ok_or(Error::Again)?;

        let core = self.core.read();
        let offset = core.data.metadata()?.len();
        core.tree
            .append_record(&ObjectRecord::tombstone(oid, offset as u32, crc))?;
        self.bump_last_oid(oid);
        Ok(())
    }

    /// Read the payload of `oid` into `buf` and return its stored CRC
    ///
    /// `size` must equal the indexed size and the indexed region must lie
    /// within the data file, else [`Error::ParamMismatch`].
    pub fn read(&self, oid: u64, size: u32, buf: &mut [u8]) -> Result<u32> {
        if self.last_oid() < oid {
            return Err(Error::ObjectNotFound);
        }

        let core = self.core.read();
        let file_len = core.data.metadata()?.len();
        let rec = core.tree.get(oid).ok_or(Error::ObjectNotFound)?;

        if rec.size != size
            || buf.len() < size as usize
            || u64::from(rec.offset) + u64::from(size) > file_len
        {
            return Err(Error::ParamMismatch);
        }

        core.data
            .read_exact_at(&mut buf[..size as usize], u64::from(rec.offset))?;
        Ok(rec.crc)
    }

    /// Tombstone `oid` in the index
    ///
    /// The payload stays in the data file until compaction.
    pub fn mark_delete(&self, oid: u64) -> Result<()> {
        let core = self.core.read();
        core.tree.delete(oid)
    }

    /// Record for `oid`, if live
    pub fn get_object(&self, oid: u64) -> Result<ObjectRecord> {
        let core = self.core.read();
        core.tree.get(oid).ok_or(Error::ObjectNotFound)
    }

    /// Next unused object id; nothing is persisted
    pub fn alloc_object_id(&self) -> u64 {
        self.last_oid() + 1
    }

    /// Fsync the index file, then the data file
    pub fn sync(&self) -> Result<()> {
        let core = self.core.read();
        core.tree.sync()?;
        core.data.sync_all()?;
        Ok(())
    }

    /// Watermark descriptor for the repair protocol
    pub fn watermark(&self) -> FileInfo {
        FileInfo::new(self.id, self.last_oid())
    }

    /// Oids whose latest persisted index entry is a tombstone
    ///
    /// Snapshots the watermark first, then scans the on-disk index; only
    /// oids at or below the snapshot are reported, and the scan stops at
    /// the first entry above it. The snapshot is retained for the repair
    /// engine's delete propagation.
    pub fn del_objects(&self) -> Result<Vec<u64>> {
        let sync_last_oid = self.last_oid();
        self.sync_last_oid.store(sync_last_oid, Ordering::SeqCst);

        let core = self.core.read();
        let mut latest: BTreeMap<u64, u32> = BTreeMap::new();
        core.tree.walk(|rec| {
            if rec.oid > sync_last_oid {
                return false;
            }
            latest.insert(rec.oid, rec.size);
            true
        })?;

        Ok(latest
            .into_iter()
            .filter(|&(_, size)| size == TOMBSTONE)
            .map(|(oid, _)| oid)
            .collect())
    }

    /// Reconcile oids a peer has already deleted
    ///
    /// Tombstones every oid still live here; absent or already-tombstoned
    /// oids are skipped.
    pub fn apply_del_objects(&self, oids: &[u64]) -> Result<()> {
        let core = self.core.read();
        for &oid in oids {
            match core.tree.delete(oid) {
                Ok(()) | Err(Error::ObjectNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Live and tombstoned records with oid in `range`, ascending
    pub fn objects_in_range(&self, range: RangeInclusive<u64>) -> Vec<ObjectRecord> {
        let core = self.core.read();
        core.tree.objects_in_range(range)
    }

    /// Aggregate checksum for store snapshots
    ///
    /// Returns the CRC over live records, the watermark, and the live
    /// record count.
    pub fn checksum(&self) -> (u32, u64, u64) {
        let core = self.core.read();
        let (crc, count) = core.tree.live_checksum();
        (crc, self.last_oid(), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tinyblob_common::crc32;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::open(dir.path(), 1).unwrap();

        let data = b"hello";
        chunk.write(1, 5, data, crc32(data)).unwrap();

        let mut buf = [0u8; 5];
        let crc = chunk.read(1, 5, &mut buf).unwrap();
        assert_eq!(&buf, data);
        assert_eq!(crc, crc32(data));
        assert_eq!(chunk.last_oid(), 1);
    }

    #[test]
    fn test_stale_oid_rejected() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::open(dir.path(), 1).unwrap();

        chunk.write(1, 5, b"hello", 0).unwrap();
        assert!(matches!(
            chunk.write(1, 5, b"again", 0),
            Err(Error::ObjectSmaller { oid: 1, last_oid: 1 })
        ));

        chunk.write(2, 5, b"world", 0).unwrap();
        assert_eq!(chunk.last_oid(), 2);
    }

    #[test]
    fn test_read_param_mismatch() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::open(dir.path(), 1).unwrap();

        chunk.write(1, 5, b"hello", 0).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            chunk.read(1, 8, &mut buf),
            Err(Error::ParamMismatch)
        ));
        assert!(matches!(
            chunk.read(2, 5, &mut buf),
            Err(Error::ObjectNotFound)
        ));
    }

    #[test]
    fn test_mark_delete_hides_object() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::open(dir.path(), 1).unwrap();

        chunk.write(1, 5, b"hello", 0).unwrap();
        chunk.mark_delete(1).unwrap();

        let mut buf = [0u8; 5];
        assert!(matches!(
            chunk.read(1, 5, &mut buf),
            Err(Error::ObjectNotFound)
        ));
        assert_eq!(chunk.del_objects().unwrap(), vec![1]);

        // the payload is still on disk until compaction
        assert_eq!(std::fs::metadata(&chunk.data_path).unwrap().len(), 5);
    }

    #[test]
    fn test_delete_dentry_persists_without_map_update() {
        let dir = tempdir().unwrap();

        {
            let chunk = Chunk::open(dir.path(), 1).unwrap();
            chunk.write(1, 5, b"hello", 0).unwrap();
            chunk.write_delete_dentry(3, 0).unwrap();
            assert_eq!(chunk.last_oid(), 3);
            // the running map never saw oid 3
            assert!(chunk.get_object(3).is_err());
            assert_eq!(chunk.del_objects().unwrap(), vec![3]);
        }

        // the tombstone becomes visible to the map after replay
        let chunk = Chunk::open(dir.path(), 1).unwrap();
        assert_eq!(chunk.last_oid(), 3);
        assert!(chunk.get_object(3).is_err());
        assert_eq!(chunk.del_objects().unwrap(), vec![3]);
    }

    #[test]
    fn test_reboot_replay_equivalence() {
        let dir = tempdir().unwrap();

        let before = {
            let chunk = Chunk::open(dir.path(), 1).unwrap();
            chunk.write(1, 5, b"hello", crc32(b"hello")).unwrap();
            chunk.write(2, 5, b"world", crc32(b"world")).unwrap();
            chunk.mark_delete(1).unwrap();
            chunk.objects_in_range(1..=2)
        };

        let chunk = Chunk::open(dir.path(), 1).unwrap();
        assert_eq!(chunk.last_oid(), 2);
        assert_eq!(chunk.objects_in_range(1..=2), before);

        let mut buf = [0u8; 5];
        let crc = chunk.read(2, 5, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(crc, crc32(b"world"));
    }

    #[test]
    fn test_alloc_object_id() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::open(dir.path(), 1).unwrap();

        assert_eq!(chunk.alloc_object_id(), 1);
        chunk.write(1, 2, b"ab", 0).unwrap();
        assert_eq!(chunk.alloc_object_id(), 2);
        // nothing is persisted by allocation alone
        assert_eq!(chunk.alloc_object_id(), 2);
    }

    #[test]
    fn test_del_objects_honors_snapshot() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::open(dir.path(), 1).unwrap();

        chunk.write(1, 2, b"ab", 0).unwrap();
        chunk.write(2, 2, b"cd", 0).unwrap();
        chunk.mark_delete(1).unwrap();
        assert_eq!(chunk.del_objects().unwrap(), vec![1]);
        assert_eq!(chunk.sync_last_oid(), 2);

        // a delete dentry raises the watermark, so it is published too
        chunk.write_delete_dentry(9, 0).unwrap();
        chunk.mark_delete(2).unwrap();
        assert_eq!(chunk.del_objects().unwrap(), vec![1, 2, 9]);
    }

    #[test]
    fn test_apply_del_objects_idempotent() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::open(dir.path(), 1).unwrap();

        chunk.write(1, 2, b"ab", 0).unwrap();
        chunk.write(2, 2, b"cd", 0).unwrap();

        chunk.apply_del_objects(&[1, 5]).unwrap();
        chunk.apply_del_objects(&[1]).unwrap();

        let mut buf = [0u8; 2];
        assert!(matches!(
            chunk.read(1, 2, &mut buf),
            Err(Error::ObjectNotFound)
        ));
        assert!(chunk.read(2, 2, &mut buf).is_ok());
    }
}
