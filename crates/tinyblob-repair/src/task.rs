//! Repair task generation
//!
//! Each repair round gathers every replica's per-chunk watermarks, then
//! diffs them: for each chunk the replica holding the highest watermark
//! is the source of truth, and every replica below it gets a streaming
//! fix task. The leader additionally publishes its tombstoned oids so
//! followers can reconcile deletes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tinyblob_common::config::CHUNK_COUNT;
use tinyblob_common::types::FileInfo;
use tinyblob_common::Result;
use tinyblob_store::BlobStore;
use tracing::info;

/// Bounds of one streaming repair read, JSON-encoded on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairTask {
    pub file_id: u32,
    /// First oid the follower is missing
    pub start_obj: u64,
    /// Source watermark: the last oid to stream
    pub end_obj: u64,
}

/// One replica's view of the store plus the work assigned to it
#[derive(Clone, Debug, Default)]
pub struct MemberFileMetas {
    /// Replica address
    pub addr: String,
    /// Watermark per chunk id
    pub files: HashMap<u32, FileInfo>,
    /// Chunks this replica must stream from a source of truth
    pub need_fix: Vec<FileInfo>,
    /// Chunks this replica must reconcile deletes for
    pub need_delete: Vec<FileInfo>,
}

impl MemberFileMetas {
    /// Create empty metas for a replica
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }
}

/// Assign fix and delete tasks across the replica set
///
/// `members[0]` is the local leader and `store` its blob store. Fix
/// tasks point every lagging replica at the replica with the highest
/// watermark for that chunk; delete tasks point every follower holding
/// a chunk with published tombstones at the leader.
pub fn generate_repair_tasks(store: &BlobStore, members: &mut [MemberFileMetas]) -> Result<()> {
    generate_fix_tasks(members);
    generate_delete_tasks(store, members)
}

/// Point each lagging replica at the highest watermark it is missing
fn generate_fix_tasks(members: &mut [MemberFileMetas]) {
    if members.is_empty() {
        return;
    }

    let mut file_ids: Vec<u32> = members[0].files.keys().copied().collect();
    file_ids.sort_unstable();

    for file_id in file_ids {
        if file_id > CHUNK_COUNT {
            continue;
        }

        let Some(source_index) = max_watermark_index(members, file_id) else {
            continue;
        };
        let max_size = members[source_index].files[&file_id].size;
        let source = members[source_index].addr.clone();

        for (index, member) in members.iter_mut().enumerate() {
            if index == source_index {
                continue;
            }
            let Some(info) = member.files.get(&file_id) else {
                continue;
            };
            if info.size < max_size {
                let fix = FileInfo {
                    file_id,
                    size: max_size,
                    source: source.clone(),
                };
                info!(member = %member.addr, ?fix, "generated chunk fix task");
                member.need_fix.push(fix);
            }
        }
    }
}

/// Index of the member holding the highest watermark for `file_id`
///
/// Ties resolve to the earliest member, so the leader wins over an
/// equally caught-up follower.
fn max_watermark_index(members: &[MemberFileMetas], file_id: u32) -> Option<usize> {
    members
        .iter()
        .enumerate()
        .filter_map(|(index, member)| member.files.get(&file_id).map(|info| (index, info.size)))
        .fold(None, |best, (index, size)| match best {
            Some((_, best_size)) if size <= best_size => best,
            _ => Some((index, size)),
        })
        .map(|(index, _)| index)
}

/// Point followers holding tombstoned chunks at the leader
fn generate_delete_tasks(store: &BlobStore, members: &mut [MemberFileMetas]) -> Result<()> {
    if members.is_empty() {
        return Ok(());
    }
    let leader_addr = members[0].addr.clone();

    let mut file_ids: Vec<u32> = members[0].files.keys().copied().collect();
    file_ids.sort_unstable();

    for file_id in file_ids {
        if file_id > CHUNK_COUNT {
            continue;
        }
        let deletes = store.get_del_objects(file_id)?;
        if deletes.is_empty() {
            continue;
        }

        for member in members.iter_mut().skip(1) {
            if member.files.contains_key(&file_id) {
                let task = FileInfo {
                    file_id,
                    size: 0,
                    source: leader_addr.clone(),
                };
                info!(member = %member.addr, file_id, "generated delete propagation task");
                member.need_delete.push(task);
            }
        }
    }
    Ok(())
}
