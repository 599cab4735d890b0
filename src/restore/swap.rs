//! Region file swap
//!
//! Two steps with different failure guarantees:
//!
//! - `stage` builds every replacement region file next to its target and
//!   lists the region files to delete. It reads blobs and live files but
//!   changes nothing live; on error all staged files are removed.
//! - `commit` renames staged files over their targets and deletes the
//!   listed ones. Each rename is atomic per file; a failure after the
//!   first change is reported as partially applied.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use crate::catalog::PartitionRef;
use crate::content_store::{BlobError, BlobHash, ContentStore};
use crate::durability::{fsync_dir, staging_path};
use crate::partition::{ChunkPos, DatasetLayout, PartitionKey, RestoreScope, ShardKey};
use crate::region::RegionFile;
use crate::retry::RetryPolicy;

use super::errors::{RestoreError, RestoreResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapReport {
    /// Region files that existed and were replaced
    pub replaced: usize,
    /// Region files that did not exist before
    pub created: usize,
    /// Region files with no counterpart in the backup
    pub deleted: usize,
    /// Partitions written into the staged files
    pub partitions: usize,
}

#[derive(Debug)]
struct StagedShard {
    shard: ShardKey,
    staged: PathBuf,
    target: PathBuf,
    existed: bool,
}

/// Replacement files ready to be committed.
#[derive(Debug)]
pub struct SwapPlan {
    staged: Vec<StagedShard>,
    deletions: Vec<(ShardKey, PathBuf)>,
    partitions: usize,
}

impl SwapPlan {
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn deletion_count(&self) -> usize {
        self.deletions.len()
    }

    fn discard(&self) {
        for staged in &self.staged {
            let _ = fs::remove_file(&staged.staged);
        }
    }
}

/// Builds replacement files for every shard the scope touches.
///
/// Inside a fully covered shard only backup content survives. For a shard
/// the scope covers partly, live partitions outside the scope are carried
/// over unchanged. Shards of `preserved_worlds` are left alone. Blob reads
/// that fail with an I/O error are retried under `retry`. Must run while
/// the shards' workers are quiesced.
pub fn stage(
    layout: &DatasetLayout,
    refs: &[PartitionRef],
    store: &ContentStore,
    scope: &RestoreScope,
    preserved_worlds: &[String],
    retry: &RetryPolicy,
) -> RestoreResult<SwapPlan> {
    let preserved = |world: &str| preserved_worlds.iter().any(|w| w == world);

    let mut from_backup: BTreeMap<ShardKey, Vec<(u16, BlobHash)>> = BTreeMap::new();
    for r in refs
        .iter()
        .filter(|r| scope.includes_partition(&r.partition) && !preserved(&r.partition.world))
    {
        from_backup
            .entry(r.partition.shard())
            .or_default()
            .push((r.partition.pos.local_index(), r.hash));
    }

    let live: BTreeSet<ShardKey> = layout
        .list_all_shards()
        .map_err(|e| RestoreError::aborted("dataset", "listing region files failed").with_source(e))?
        .into_iter()
        .filter(|s| scope.touches_shard(s) && !preserved(&s.world))
        .collect();

    let shards: BTreeSet<ShardKey> = live.iter().cloned().chain(from_backup.keys().cloned()).collect();

    let mut plan = SwapPlan {
        staged: Vec::new(),
        deletions: Vec::new(),
        partitions: 0,
    };

    for shard in shards {
        let target = layout.shard_path(&shard);
        let existed = live.contains(&shard);
        let backup_slots = from_backup.remove(&shard).unwrap_or_default();

        let entries = match build_entries(&shard, &target, existed, backup_slots, store, scope, retry) {
            Ok(entries) => entries,
            Err(e) => {
                plan.discard();
                return Err(e);
            }
        };

        if entries.is_empty() {
            if existed {
                plan.deletions.push((shard, target));
            }
            continue;
        }

        if let Err(e) = write_staged(&shard, &target, &entries).map(|staged| {
            plan.partitions += entries.len();
            plan.staged.push(StagedShard {
                shard: shard.clone(),
                staged,
                target: target.clone(),
                existed,
            });
        }) {
            plan.discard();
            return Err(e);
        }
    }

    Ok(plan)
}

fn build_entries(
    shard: &ShardKey,
    target: &std::path::Path,
    existed: bool,
    backup_slots: Vec<(u16, BlobHash)>,
    store: &ContentStore,
    scope: &RestoreScope,
    retry: &RetryPolicy,
) -> RestoreResult<Vec<(u16, Vec<u8>)>> {
    let mut entries: BTreeMap<u16, Vec<u8>> = BTreeMap::new();

    if existed && !scope.covers_shard(shard) {
        let mut live = RegionFile::open_read_only(target)
            .map_err(|e| RestoreError::aborted(shard.to_string(), format!("reading live region: {}", e)))?;
        let live_entries = live
            .entries()
            .map_err(|e| RestoreError::aborted(shard.to_string(), format!("reading live region: {}", e)))?;
        for (slot, data) in live_entries {
            let key = PartitionKey::new(shard.world.clone(), ChunkPos::from_local(shard.region, slot));
            if !scope.includes_partition(&key) {
                entries.insert(slot, data);
            }
        }
    }

    for (slot, hash) in backup_slots {
        let data = retry
            .run("blob read", BlobError::is_transient, || store.read(&hash))
            .map_err(|e| RestoreError::aborted(shard.to_string(), format!("reading blob {}: {}", hash, e)))?;
        entries.insert(slot, data);
    }

    Ok(entries.into_iter().collect())
}

fn write_staged(shard: &ShardKey, target: &std::path::Path, entries: &[(u16, Vec<u8>)]) -> RestoreResult<PathBuf> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            RestoreError::aborted(shard.to_string(), "creating region directory failed").with_source(e)
        })?;
    }
    let staged = staging_path(target, "restore");
    if let Err(e) = RegionFile::write_compacted(&staged, entries) {
        let _ = fs::remove_file(&staged);
        return Err(RestoreError::aborted(shard.to_string(), format!("staging region: {}", e)));
    }
    Ok(staged)
}

/// Applies a staged plan to the live dataset.
pub fn commit(plan: SwapPlan) -> RestoreResult<SwapReport> {
    let mut report = SwapReport {
        partitions: plan.partitions,
        ..SwapReport::default()
    };
    let mut changed = 0usize;
    let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();

    let fail = |plan: &SwapPlan, changed: usize, err: RestoreError| -> RestoreError {
        plan.discard();
        if changed > 0 {
            err.into_partially_applied()
        } else {
            err
        }
    };

    for staged in &plan.staged {
        if let Err(e) = fs::rename(&staged.staged, &staged.target) {
            let err = RestoreError::aborted(staged.shard.to_string(), "replacing region file failed").with_source(e);
            return Err(fail(&plan, changed, err));
        }
        changed += 1;
        if staged.existed {
            report.replaced += 1;
        } else {
            report.created += 1;
        }
        if let Some(parent) = staged.target.parent() {
            dirs.insert(parent.to_path_buf());
        }
    }

    for (shard, path) in &plan.deletions {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let err = RestoreError::aborted(shard.to_string(), "deleting region file failed").with_source(e);
                return Err(fail(&plan, changed, err));
            }
        }
        changed += 1;
        report.deleted += 1;
        if let Some(parent) = path.parent() {
            dirs.insert(parent.to_path_buf());
        }
    }

    for dir in dirs {
        fsync_dir(&dir).map_err(|e| {
            RestoreError::partially_applied(dir.display().to_string(), "fsync of region directory failed")
                .with_source(e)
        })?;
    }

    Ok(report)
}
