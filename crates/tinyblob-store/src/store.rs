//! Multi-chunk blob store
//!
//! A [`BlobStore`] owns a fixed set of [`CHUNK_COUNT`] chunks under one
//! directory and routes every operation by `(chunk id, object id)`. Two
//! bounded queues classify chunk ids as writable or not-writable; they
//! are scheduling hints for the control loop, not capabilities. Every id
//! sits in exactly one queue, except while a worker holds it between a
//! take and a put.

use crossbeam_queue::ArrayQueue;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tinyblob_common::config::CHUNK_COUNT;
use tinyblob_common::types::{FileInfo, ObjectRecord, SnapshotFile};
use tinyblob_common::{Error, Result, StoreConfig};
use tracing::info;

use crate::chunk::Chunk;

/// Fixed-cardinality store over one data directory
pub struct BlobStore {
    data_dir: PathBuf,
    chunks: Vec<Arc<Chunk>>,
    avail: ArrayQueue<u32>,
    unavail: ArrayQueue<u32>,
    store_size: u64,
    pub(crate) chunk_size: u64,
}

impl BlobStore {
    /// Open a store, creating the directory and chunk files as needed
    ///
    /// All chunk ids start in the unavailable queue; the control loop
    /// promotes them once the store is ready to take writes.
    pub fn new(dir: impl AsRef<Path>, store_size: u64) -> Result<Self> {
        let data_dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let mut chunks = Vec::with_capacity(CHUNK_COUNT as usize);
        for id in 1..=CHUNK_COUNT {
            chunks.push(Arc::new(Chunk::open(&data_dir, id)?));
        }

        let capacity = (CHUNK_COUNT + 1) as usize;
        let avail = ArrayQueue::new(capacity);
        let unavail = ArrayQueue::new(capacity);
        for id in 1..=CHUNK_COUNT {
            let _ = unavail.push(id);
        }

        info!(dir = %data_dir.display(), store_size, "blob store opened");

        Ok(Self {
            data_dir,
            chunks,
            avail,
            unavail,
            store_size,
            chunk_size: store_size / u64::from(CHUNK_COUNT),
        })
    }

    /// Open a store from a [`StoreConfig`]
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::new(&config.data_dir, config.store_size)
    }

    pub(crate) fn chunk(&self, id: u32) -> Result<&Arc<Chunk>> {
        if (1..=CHUNK_COUNT).contains(&id) {
            Ok(&self.chunks[(id - 1) as usize])
        } else {
            Err(Error::ChunkNotFound(id))
        }
    }

    /// Number of chunks in the store
    pub fn chunk_count(&self) -> u32 {
        CHUNK_COUNT
    }

    /// Aggregate store size in bytes
    pub fn store_size(&self) -> u64 {
        self.store_size
    }

    /// Append one object to a chunk
    pub fn write(&self, file_id: u32, oid: u64, size: u32, data: &[u8], crc: u32) -> Result<()> {
        self.chunk(file_id)?.write(oid, size, data, crc)
    }

    /// Append a tombstone index entry for an oid a peer deleted
    pub fn write_delete_dentry(&self, file_id: u32, oid: u64, crc: u32) -> Result<()> {
        self.chunk(file_id)?.write_delete_dentry(oid, crc)
    }

    /// Read an object's payload and return its stored CRC
    pub fn read(&self, file_id: u32, oid: u64, size: u32, buf: &mut [u8]) -> Result<u32> {
        self.chunk(file_id)?.read(oid, size, buf)
    }

    /// Tombstone an object in a chunk's index
    pub fn mark_delete(&self, file_id: u32, oid: u64) -> Result<()> {
        self.chunk(file_id)?.mark_delete(oid)
    }

    /// Fsync one chunk's index and data files
    pub fn sync(&self, file_id: u32) -> Result<()> {
        self.chunk(file_id)?.sync()
    }

    /// Fsync every chunk
    pub fn sync_all(&self) -> Result<()> {
        for chunk in &self.chunks {
            chunk.sync()?;
        }
        Ok(())
    }

    /// Next unused object id for a chunk; nothing is persisted
    pub fn alloc_object_id(&self, file_id: u32) -> Result<u64> {
        Ok(self.chunk(file_id)?.alloc_object_id())
    }

    /// Watermark of one chunk
    pub fn last_oid(&self, file_id: u32) -> Result<u64> {
        Ok(self.chunk(file_id)?.last_oid())
    }

    /// Index record for a live object
    pub fn get_object(&self, file_id: u32, oid: u64) -> Result<ObjectRecord> {
        self.chunk(file_id)?.get_object(oid)
    }

    /// Watermark descriptor of one chunk
    pub fn get_watermark(&self, file_id: u32) -> Result<FileInfo> {
        Ok(self.chunk(file_id)?.watermark())
    }

    /// Watermark descriptors of every chunk
    pub fn all_watermarks(&self) -> Vec<FileInfo> {
        self.chunks.iter().map(|chunk| chunk.watermark()).collect()
    }

    /// Oids of one chunk whose latest persisted index entry is a tombstone
    pub fn get_del_objects(&self, file_id: u32) -> Result<Vec<u64>> {
        self.chunk(file_id)?.del_objects()
    }

    /// Reconcile oids a peer has already deleted
    pub fn apply_del_objects(&self, file_id: u32, oids: &[u64]) -> Result<()> {
        self.chunk(file_id)?.apply_del_objects(oids)
    }

    /// Live and tombstoned records of one chunk with oid in `range`
    pub fn objects_in_range(
        &self,
        file_id: u32,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<ObjectRecord>> {
        Ok(self.chunk(file_id)?.objects_in_range(range))
    }

    /// Take a chunk id from the writable queue
    pub fn get_avail_chunk(&self) -> Result<u32> {
        self.avail.pop().ok_or(Error::NoAvailableChunk)
    }

    /// Return a chunk id to the writable queue
    pub fn put_avail_chunk(&self, chunk_id: u32) {
        let _ = self.avail.push(chunk_id);
    }

    /// Take a chunk id from the not-writable queue
    pub fn get_unavail_chunk(&self) -> Result<u32> {
        self.unavail.pop().ok_or(Error::NoUnavailableChunk)
    }

    /// Return a chunk id to the not-writable queue
    pub fn put_unavail_chunk(&self, chunk_id: u32) {
        let _ = self.unavail.push(chunk_id);
    }

    /// Pick a chunk to write into
    ///
    /// The caller owns the returned id until it puts it back into one of
    /// the queues.
    pub fn get_chunk_for_write(&self) -> Result<u32> {
        self.avail.pop().ok_or(Error::NoAvailableChunk)
    }

    /// Throttle writers by parking up to two writable chunks
    ///
    /// A no-op while the not-writable queue already holds two ids.
    pub fn move_chunks_to_unavail(&self) {
        if self.unavail.len() >= 2 {
            return;
        }
        for _ in 0..2 {
            match self.avail.pop() {
                Some(chunk_id) => {
                    let _ = self.unavail.push(chunk_id);
                }
                None => return,
            }
        }
    }

    /// Number of writable chunk ids
    pub fn avail_len(&self) -> usize {
        self.avail.len()
    }

    /// Number of not-writable chunk ids
    pub fn unavail_len(&self) -> usize {
        self.unavail.len()
    }

    /// Describe every chunk file for replica comparison
    ///
    /// Lists the data directory and emits one entry per file name that
    /// parses as a chunk id, carrying the chunk's aggregate checksum,
    /// watermark and live record count.
    pub fn snapshot(&self) -> Result<Vec<SnapshotFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(id) = name.parse::<u32>() else {
                continue;
            };
            let Ok(chunk) = self.chunk(id) else {
                continue;
            };

            let meta = entry.metadata()?;
            let modified = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;

            let (crc, last_obj_id, needle_cnt) = chunk.checksum();
            files.push(SnapshotFile {
                name,
                crc,
                modified,
                mark_del: false,
                last_obj_id,
                needle_cnt,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Tear the store down: close every chunk and remove the directory
    pub fn delete_store(self) -> Result<()> {
        let Self {
            data_dir, chunks, ..
        } = self;
        drop(chunks);
        fs::remove_dir_all(&data_dir)?;
        Ok(())
    }
}
