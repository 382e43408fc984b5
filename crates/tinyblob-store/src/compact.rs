//! Chunk compaction
//!
//! Compaction rewrites one chunk to drop tombstoned and dead regions.
//! The rebuild phase copies live records into sibling files
//! (`<id>.compact`, `<id>.idx.compact`) while readers keep using the old
//! ones; the commit phase takes the commit lock exclusively, renames the
//! siblings over the canonical paths and swaps in the rebuilt tree.
//!
//! A rebuild failure leaves the chunk untouched. A commit failure leaves
//! whichever half-committed state the rename sequence reached; no
//! recovery is attempted and the caller is expected to quarantine the
//! chunk.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::Duration;
use tinyblob_common::config::{COMPACT_MAX_WAIT, COMPACT_THRESHOLD};
use tinyblob_common::{Error, Result};
use tracing::{debug, info};

use crate::chunk::{Chunk, ChunkCore};
use crate::index::IndexTree;
use crate::store::BlobStore;

struct RebuiltChunk {
    data: File,
    tree: IndexTree,
}

impl Chunk {
    /// Rewrite this chunk, dropping dead regions
    ///
    /// Waits up to `max_wait` for in-flight writers to drain; if they
    /// keep the chunk busy the call is a no-op reporting zero released
    /// bytes. Returns the number of bytes reclaimed.
    pub(crate) fn compact(&self, max_wait: Duration) -> Result<u64> {
        let Some(_guard) = self.compact_lock.try_lock_for(max_wait) else {
            debug!(chunk = self.id, "compaction skipped, writers held the chunk");
            return Ok(0);
        };

        let size_before = self.core.read().tree.file_bytes();

        let rebuilt = match self.rebuild() {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                let (data_side, idx_side) = self.sibling_paths();
                let _ = fs::remove_file(&data_side);
                let _ = fs::remove_file(&idx_side);
                return Err(Error::Compaction(e.to_string()));
            }
        };

        {
            let mut core = self.core.write();
            self.swap_in(&mut core, rebuilt)
                .map_err(|e| Error::Commit(e.to_string()))?;
        }

        self.sync()?;

        let size_after = self.core.read().tree.file_bytes();
        let released = size_before.saturating_sub(size_after);
        info!(chunk = self.id, released, "compaction finished");
        Ok(released)
    }

    fn sibling_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.data_path.with_extension("compact"),
            self.index_path.with_extension("idx.compact"),
        )
    }

    /// Copy live records into fresh sibling files
    fn rebuild(&self) -> Result<RebuiltChunk> {
        let (data_side, idx_side) = self.sibling_paths();
        for stale in [&data_side, &idx_side] {
            match fs::remove_file(stale) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let open = |path: &PathBuf| {
            OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(path)
        };
        let data = open(&data_side)?;
        let idx_file = open(&idx_side)?;
        // The rebuilt tree keeps the canonical index path: once the
        // commit renames the siblings, walks of that path read the
        // rebuilt file.
        let tree = IndexTree::new(self.index_path.clone(), idx_file);

        let core = self.core.read();
        let mut new_offset: u32 = 0;
        for rec in core
            .tree
            .objects_in_range(0..=u64::MAX)
            .into_iter()
            .filter(|rec| !rec.is_tombstone())
        {
            let mut payload = vec![0u8; rec.size as usize];
            core.data.read_exact_at(&mut payload, u64::from(rec.offset))?;
            (&data).write_all(&payload)?;
            tree.set(rec.oid, new_offset, rec.size, rec.crc)?;
            new_offset += rec.size;
        }

        Ok(RebuiltChunk { data, tree })
    }

    /// Rename the siblings over the canonical paths and publish the
    /// rebuilt state; the replaced handles close on overwrite
    fn swap_in(&self, core: &mut ChunkCore, rebuilt: RebuiltChunk) -> std::io::Result<()> {
        let (data_side, idx_side) = self.sibling_paths();
        fs::rename(&data_side, &self.data_path)?;
        fs::rename(&idx_side, &self.index_path)?;
        core.data = rebuilt.data;
        core.tree = rebuilt.tree;
        Ok(())
    }
}

impl BlobStore {
    /// Check whether a chunk's dead ratio warrants compaction
    ///
    /// A negative `threshold` falls back to the default. A chunk is
    /// eligible once its live bytes reach 40% of the chunk space and its
    /// dead bytes reach `threshold` percent of the live bytes. Returns
    /// the eligibility along with the current dead-to-live ratio.
    pub fn is_ready_to_compact(&self, chunk_id: u32, threshold: i32) -> Result<(bool, f64)> {
        let threshold = if threshold < 0 {
            u64::from(COMPACT_THRESHOLD)
        } else {
            threshold as u64
        };

        let chunk = self.chunk(chunk_id)?;
        let core = chunk.core.read();
        let file_bytes = core.tree.file_bytes();
        let delete_bytes = core.tree.delete_bytes();

        let ratio = if file_bytes == 0 {
            0.0
        } else {
            delete_bytes as f64 / file_bytes as f64
        };

        if file_bytes < self.chunk_size * u64::from(COMPACT_THRESHOLD) / 100 {
            return Ok((false, ratio));
        }
        if delete_bytes < file_bytes * threshold / 100 {
            return Ok((false, ratio));
        }

        Ok((true, ratio))
    }

    /// Compact one chunk and report the bytes released
    pub fn do_compact_work(&self, chunk_id: u32) -> Result<u64> {
        let chunk = self.chunk(chunk_id)?;
        chunk.compact(COMPACT_MAX_WAIT)
    }
}
