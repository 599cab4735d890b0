//! Per-world chunk manager
//!
//! Owns one persistence worker per region, spawned on first use. While
//! a restore is running no new worker is spawned, so the set handed out
//! by `children()` after `pre_restore` is final.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::partition::{ChunkPos, DatasetLayout, RegionPos, ShardKey};
use crate::region::RegionStorage;
use crate::restore::{ComponentKind, Restorable, RestoreContext, RestoreError, RestoreResult};
use crate::worker::{Completion, PersistenceWorker, WorkerConfig};

use super::errors::{HostError, HostResult};

pub type RegionWorker = PersistenceWorker<RegionStorage>;

pub struct ChunkManager {
    /// Owning world, by name only
    world: String,
    layout: DatasetLayout,
    config: WorkerConfig,
    workers: RwLock<BTreeMap<RegionPos, Arc<RegionWorker>>>,
    restoring: AtomicBool,
}

impl ChunkManager {
    pub fn new(world: impl Into<String>, layout: DatasetLayout, config: WorkerConfig) -> Self {
        Self {
            world: world.into(),
            layout,
            config,
            workers: RwLock::new(BTreeMap::new()),
            restoring: AtomicBool::new(false),
        }
    }

    pub fn world(&self) -> &str {
        &self.world
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    /// Worker for `region`, spawning it if needed.
    pub fn worker(&self, region: RegionPos) -> HostResult<Arc<RegionWorker>> {
        if let Some(worker) = self.read_workers().get(&region) {
            return Ok(Arc::clone(worker));
        }

        let mut workers = self.workers.write().unwrap_or_else(|p| p.into_inner());
        if self.is_restoring() {
            return Err(HostError::Restoring(format!("chunks:{}", self.world)));
        }
        if let Some(worker) = workers.get(&region) {
            return Ok(Arc::clone(worker));
        }

        let shard = ShardKey::new(self.world.clone(), region);
        let storage = RegionStorage::new(shard.clone(), self.layout.shard_path(&shard));
        let worker = RegionWorker::spawn(storage, &self.config)?;
        workers.insert(region, Arc::clone(&worker));
        Ok(worker)
    }

    /// Spawns workers for every region file already on disk.
    pub fn open_on_disk(&self) -> HostResult<usize> {
        let shards = self
            .layout
            .list_shards(&self.world)
            .map_err(|e| HostError::io(self.layout.region_dir(&self.world), e))?;
        for shard in &shards {
            self.worker(shard.region)?;
        }
        Ok(shards.len())
    }

    pub fn load(&self, pos: ChunkPos) -> HostResult<Option<Vec<u8>>> {
        Ok(self.worker(pos.region())?.load(pos).wait()?)
    }

    pub fn store(&self, pos: ChunkPos, data: Vec<u8>) -> HostResult<Completion<()>> {
        Ok(self.worker(pos.region())?.store(pos, data))
    }

    pub fn workers(&self) -> Vec<Arc<RegionWorker>> {
        self.read_workers().values().cloned().collect()
    }

    pub fn flush_all(&self) -> HostResult<()> {
        for worker in self.workers() {
            worker.flush()?;
        }
        Ok(())
    }

    /// Every stored chunk of every open region, after pending writes.
    pub fn snapshot_all(&self) -> HostResult<Vec<(ChunkPos, Vec<u8>)>> {
        let mut out = Vec::new();
        for worker in self.workers() {
            out.extend(worker.snapshot()?);
        }
        Ok(out)
    }

    /// Flushes and stops every worker.
    pub fn unload(&self) -> HostResult<()> {
        self.flush_all()?;
        self.workers.write().unwrap_or_else(|p| p.into_inner()).clear();
        Ok(())
    }

    fn read_workers(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RegionPos, Arc<RegionWorker>>> {
        self.workers.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl Restorable for ChunkManager {
    fn kind(&self) -> ComponentKind {
        ComponentKind::ChunkManager
    }

    fn label(&self) -> String {
        format!("chunks:{}", self.world)
    }

    fn pre_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        let _workers = self.workers.write().unwrap_or_else(|p| p.into_inner());
        self.restoring.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Also picks up region files the restore created.
    fn post_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.restoring.store(false, Ordering::SeqCst);
        self.open_on_disk()
            .map(|_| ())
            .map_err(|e| RestoreError::failed(format!("reopening regions: {}", e)))
    }

    fn children(&self) -> Vec<Arc<dyn Restorable>> {
        self.workers()
            .into_iter()
            .map(|w| w as Arc<dyn Restorable>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup_manager() -> (TempDir, ChunkManager) {
        let dir = TempDir::new().unwrap();
        let manager = ChunkManager::new("overworld", DatasetLayout::new(dir.path()), WorkerConfig::default());
        (dir, manager)
    }

    #[test]
    fn test_one_worker_per_region() {
        let (_dir, manager) = setup_manager();
        manager.store(ChunkPos::new(0, 0), b"a".to_vec()).unwrap().wait().unwrap();
        manager.store(ChunkPos::new(1, 1), b"b".to_vec()).unwrap().wait().unwrap();
        manager.store(ChunkPos::new(40, 0), b"c".to_vec()).unwrap().wait().unwrap();
        assert_eq!(manager.workers().len(), 2);
        assert_eq!(manager.load(ChunkPos::new(1, 1)).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_no_new_workers_while_restoring() {
        let (_dir, manager) = setup_manager();
        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        manager.pre_restore(&ctx).unwrap();
        let err = manager.worker(RegionPos::new(3, 3)).unwrap_err();
        assert!(err.is_restoring());
        manager.post_restore(&ctx).unwrap();
        assert!(manager.worker(RegionPos::new(3, 3)).is_ok());
    }

    #[test]
    fn test_open_on_disk_finds_existing_regions() {
        let (dir, manager) = setup_manager();
        manager.store(ChunkPos::new(0, 0), b"a".to_vec()).unwrap().wait().unwrap();
        manager.store(ChunkPos::new(-1, 0), b"b".to_vec()).unwrap().wait().unwrap();
        manager.unload().unwrap();

        let reopened = ChunkManager::new("overworld", DatasetLayout::new(dir.path()), WorkerConfig::default());
        assert_eq!(reopened.open_on_disk().unwrap(), 2);
        assert_eq!(reopened.children().len(), 2);
        assert_eq!(reopened.snapshot_all().unwrap().len(), 2);
    }
}
