//! Per-chunk object index
//!
//! An [`IndexTree`] maps object ids to their location in the chunk data
//! file. Every mutation is shadowed by a fixed-width entry appended to an
//! on-disk index file (see [`ObjectRecord`] for the layout), from which
//! the map is rebuilt on reboot. Appends are not fsynced here; durability
//! is the caller's concern via [`IndexTree::sync`].
//!
//! The tree also tracks two counters driving the compaction trigger:
//! `file_bytes` accumulates the sizes of appended live records, and
//! `delete_bytes` accumulates the sizes shadowed by tombstones or
//! overwrites.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tinyblob_common::checksum::Crc32Builder;
use tinyblob_common::types::{ObjectRecord, RECORD_SIZE};
use tinyblob_common::{Error, Result};

/// In-memory object index backed by an append-only index file
pub struct IndexTree {
    /// Canonical path of the index file, used for replay walks
    idx_path: PathBuf,
    /// Append handle for the index file
    idx_file: Mutex<File>,
    map: RwLock<BTreeMap<u64, ObjectRecord>>,
    file_bytes: AtomicU64,
    delete_bytes: AtomicU64,
}

impl IndexTree {
    /// Create an empty tree over a fresh index file
    pub fn new(idx_path: PathBuf, idx_file: File) -> Self {
        Self {
            idx_path,
            idx_file: Mutex::new(idx_file),
            map: RwLock::new(BTreeMap::new()),
            file_bytes: AtomicU64::new(0),
            delete_bytes: AtomicU64::new(0),
        }
    }

    /// Rebuild a tree by replaying its index file
    ///
    /// Entries replayed with the same oid overwrite earlier ones; the
    /// overwritten sizes accumulate into `delete_bytes`. Returns the tree
    /// and the maximum oid seen, which becomes the chunk watermark.
    pub fn load(idx_path: PathBuf, idx_file: File) -> Result<(Self, u64)> {
        let tree = Self::new(idx_path, idx_file);
        let mut last_oid = 0u64;
        walk_index_file(&tree.idx_path, |rec| {
            tree.apply(rec);
            if rec.oid > last_oid {
                last_oid = rec.oid;
            }
            true
        })?;
        Ok((tree, last_oid))
    }

    /// Insert or overwrite the entry for `oid` and persist it
    ///
    /// The on-disk append happens first; the in-memory entry is only
    /// updated once the entry is in the file.
    pub fn set(&self, oid: u64, offset: u32, size: u32, crc: u32) -> Result<()> {
        let rec = ObjectRecord::new(oid, offset, size, crc);
        self.append_record(&rec)?;
        self.apply(&rec);
        Ok(())
    }

    /// Look up the record for `oid`
    ///
    /// Returns `None` when the oid is absent or its current record is a
    /// tombstone.
    pub fn get(&self, oid: u64) -> Option<ObjectRecord> {
        let map = self.map.read();
        map.get(&oid).copied().filter(|rec| !rec.is_tombstone())
    }

    /// Mark `oid` as deleted and persist a tombstone entry
    ///
    /// Idempotent: re-deleting a tombstoned oid succeeds without writing
    /// another entry. Deleting an absent oid is an error.
    pub fn delete(&self, oid: u64) -> Result<()> {
        {
            let map = self.map.read();
            match map.get(&oid) {
                None => return Err(Error::ObjectNotFound),
                Some(old) if old.is_tombstone() => return Ok(()),
                Some(_) => {}
            }
        }

        let rec = ObjectRecord::tombstone(oid, 0, 0);
        self.append_record(&rec)?;
        self.apply(&rec);
        Ok(())
    }

    /// Append one entry to the index file without updating the map
    ///
    /// No fsync. Exposed for the delete-dentry path, which records a
    /// tombstone on disk without making it visible to the running map.
    pub fn append_record(&self, rec: &ObjectRecord) -> Result<()> {
        let mut file = self.idx_file.lock();
        file.write_all(&rec.to_bytes())?;
        Ok(())
    }

    /// Apply one entry to the in-memory map and counters
    fn apply(&self, rec: &ObjectRecord) {
        let prev = self.map.write().insert(rec.oid, *rec);
        if let Some(old) = prev
            && !old.is_tombstone()
        {
            self.delete_bytes
                .fetch_add(u64::from(old.size), Ordering::Relaxed);
        }
        if !rec.is_tombstone() {
            self.file_bytes
                .fetch_add(u64::from(rec.size), Ordering::Relaxed);
        }
    }

    /// Replay the on-disk index file in append order
    ///
    /// The callback returns `false` to stop early. A partial trailing
    /// entry is discarded.
    pub fn walk<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&ObjectRecord) -> bool,
    {
        walk_index_file(&self.idx_path, f)
    }

    /// Live and tombstoned records with oid in `range`, ascending
    ///
    /// An inverted range is empty.
    pub fn objects_in_range(&self, range: RangeInclusive<u64>) -> Vec<ObjectRecord> {
        if range.start() > range.end() {
            return Vec::new();
        }
        let map = self.map.read();
        map.range(range).map(|(_, rec)| *rec).collect()
    }

    /// Aggregate CRC over live records plus their count
    ///
    /// Feeds the big-endian `(oid, crc)` pair of every live record, in
    /// ascending oid order, through one CRC32.
    pub fn live_checksum(&self) -> (u32, u64) {
        let map = self.map.read();
        let mut builder = Crc32Builder::new();
        let mut count = 0u64;
        for rec in map.values().filter(|rec| !rec.is_tombstone()) {
            builder.update(&rec.oid.to_be_bytes());
            builder.update(&rec.crc.to_be_bytes());
            count += 1;
        }
        (builder.finalize(), count)
    }

    /// Sum of appended live record sizes
    pub fn file_bytes(&self) -> u64 {
        self.file_bytes.load(Ordering::Relaxed)
    }

    /// Sum of sizes shadowed by tombstones or overwrites
    pub fn delete_bytes(&self) -> u64 {
        self.delete_bytes.load(Ordering::Relaxed)
    }

    /// Fsync the index file
    pub fn sync(&self) -> Result<()> {
        let file = self.idx_file.lock();
        file.sync_all()?;
        Ok(())
    }
}

/// Replay an index file entry by entry
///
/// Entries are read in append order; `f` returns `false` to stop early.
/// A missing file replays as empty, and a partial trailing entry is
/// treated as not written.
pub fn walk_index_file<F>(path: &Path, mut f: F) -> Result<()>
where
    F: FnMut(&ObjectRecord) -> bool,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut buf = [0u8; RECORD_SIZE];
    loop {
        let mut filled = 0;
        while filled < RECORD_SIZE {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < RECORD_SIZE {
            // clean EOF, or a torn final entry: discard
            return Ok(());
        }

        let rec = ObjectRecord::from_bytes(&buf)?;
        if !f(&rec) {
            return Ok(());
        }
    }
}
