//! A world: dirty chunk cache in front of its chunk manager

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::partition::{ChunkPos, DatasetLayout};
use crate::restore::{ComponentKind, Restorable, RestoreContext, RestoreError, RestoreResult};
use crate::worker::WorkerConfig;

use super::chunk::ChunkData;
use super::chunk_manager::ChunkManager;
use super::entities::EntityIndex;
use super::errors::{HostError, HostResult};
use super::tickets::TicketManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(usize),
    /// A restore is running; nothing was written
    Suppressed,
}

pub struct World {
    name: String,
    chunks: Arc<ChunkManager>,
    tickets: Arc<TicketManager>,
    entities: Arc<EntityIndex>,
    dirty: Mutex<BTreeMap<ChunkPos, ChunkData>>,
    restoring: AtomicBool,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World").field("name", &self.name).finish_non_exhaustive()
    }
}

impl World {
    pub fn new(
        name: impl Into<String>,
        layout: DatasetLayout,
        config: WorkerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let name = name.into();
        let chunks = Arc::new(ChunkManager::new(name.clone(), layout, config));
        Self {
            tickets: Arc::new(TicketManager::new(name.clone())),
            entities: Arc::new(EntityIndex::new(Arc::clone(&chunks))),
            chunks,
            name,
            dirty: Mutex::new(BTreeMap::new()),
            restoring: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunks(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    pub fn tickets(&self) -> &Arc<TicketManager> {
        &self.tickets
    }

    pub fn entities(&self) -> &Arc<EntityIndex> {
        &self.entities
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    fn dirty(&self) -> MutexGuard<'_, BTreeMap<ChunkPos, ChunkData>> {
        self.dirty.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_live(&self) -> HostResult<()> {
        if self.is_restoring() {
            return Err(HostError::Restoring(format!("world:{}", self.name)));
        }
        Ok(())
    }

    /// Unsaved edits first, then storage.
    pub fn load_chunk(&self, pos: ChunkPos) -> HostResult<Option<ChunkData>> {
        self.check_live()?;
        if let Some(chunk) = self.dirty().get(&pos) {
            return Ok(Some(chunk.clone()));
        }
        let Some(bytes) = self.chunks.load(pos)? else {
            return Ok(None);
        };
        let chunk = ChunkData::decode(pos, &bytes)?;
        self.entities.index_chunk(pos, &chunk.entities);
        Ok(Some(chunk))
    }

    /// Replaces a chunk in memory; written on the next save.
    pub fn set_chunk(&self, pos: ChunkPos, chunk: ChunkData) -> HostResult<()> {
        let mut dirty = self.dirty();
        self.check_live()?;
        self.entities.index_chunk(pos, &chunk.entities);
        dirty.insert(pos, chunk);
        Ok(())
    }

    pub fn spawn_entity(&self, pos: ChunkPos) -> HostResult<Uuid> {
        let mut chunk = self.load_chunk(pos)?.unwrap_or_default();
        let id = Uuid::new_v4();
        chunk.entities.push(id);
        self.set_chunk(pos, chunk)?;
        Ok(id)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty().len()
    }

    fn suppress_save(&self) -> SaveOutcome {
        self.metrics.increment_saves_suppressed();
        log_event_with_fields(Event::SaveSuppressed, &[("world", &self.name)]);
        SaveOutcome::Suppressed
    }

    /// Writes every dirty chunk and waits for the writes to land.
    ///
    /// A chunk whose write is refused or fails goes back into the dirty
    /// cache unless it was edited again meanwhile, so the next save
    /// retries it. If the refusal came from a restore starting under
    /// this save, the save reports `Suppressed`.
    pub fn save_all(&self) -> HostResult<SaveOutcome> {
        let pending = {
            let mut dirty = self.dirty();
            if self.is_restoring() {
                return Ok(self.suppress_save());
            }
            std::mem::take(&mut *dirty)
        };

        let mut in_flight = Vec::with_capacity(pending.len());
        let mut failed: Vec<(ChunkPos, ChunkData)> = Vec::new();
        let mut first_err: Option<HostError> = None;
        for (pos, chunk) in pending {
            match self.chunks.store(pos, chunk.encode()) {
                Ok(completion) => in_flight.push((pos, chunk, completion)),
                Err(e) => {
                    first_err.get_or_insert(e);
                    failed.push((pos, chunk));
                }
            }
        }

        let mut saved = 0;
        for (pos, chunk, completion) in in_flight {
            match completion.wait() {
                Ok(()) => saved += 1,
                Err(e) => {
                    first_err.get_or_insert(e.into());
                    failed.push((pos, chunk));
                }
            }
        }

        let Some(err) = first_err else {
            return Ok(SaveOutcome::Saved(saved));
        };
        {
            let mut dirty = self.dirty();
            for (pos, chunk) in failed {
                dirty.entry(pos).or_insert(chunk);
            }
        }
        if err.is_restoring() {
            return Ok(self.suppress_save());
        }
        Err(err)
    }

    pub fn flush_all(&self) -> HostResult<SaveOutcome> {
        let outcome = self.save_all()?;
        if outcome != SaveOutcome::Suppressed {
            self.chunks.flush_all()?;
        }
        Ok(outcome)
    }
}

impl Restorable for World {
    fn kind(&self) -> ComponentKind {
        ComponentKind::World
    }

    fn label(&self) -> String {
        format!("world:{}", self.name)
    }

    /// Hands the dirty cache to the workers without waiting; their drain
    /// applies it.
    fn pre_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        let pending = {
            let mut dirty = self.dirty();
            self.restoring.store(true, Ordering::SeqCst);
            std::mem::take(&mut *dirty)
        };
        for (pos, chunk) in pending {
            self.chunks
                .store(pos, chunk.encode())
                .map_err(|e| RestoreError::aborted(self.label(), e.to_string()))?;
        }
        Ok(())
    }

    fn post_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.restoring.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Chunk manager before the entity index, so its workers have
    /// resumed by the time the index rebuilds.
    fn children(&self) -> Vec<Arc<dyn Restorable>> {
        vec![
            Arc::clone(&self.chunks) as Arc<dyn Restorable>,
            Arc::clone(&self.tickets) as Arc<dyn Restorable>,
            Arc::clone(&self.entities) as Arc<dyn Restorable>,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup_world() -> (TempDir, World) {
        let dir = TempDir::new().unwrap();
        let world = World::new(
            "overworld",
            DatasetLayout::new(dir.path()),
            WorkerConfig::default(),
            Arc::new(MetricsRegistry::new()),
        );
        (dir, world)
    }

    #[test]
    fn test_save_all_persists_dirty_chunks() {
        let (_dir, world) = setup_world();
        world.set_chunk(ChunkPos::new(0, 0), ChunkData::new(b"a".to_vec())).unwrap();
        world.set_chunk(ChunkPos::new(1, 0), ChunkData::new(b"b".to_vec())).unwrap();
        assert_eq!(world.save_all().unwrap(), SaveOutcome::Saved(2));
        assert_eq!(world.dirty_count(), 0);
        assert_eq!(world.chunks().load(ChunkPos::new(1, 0)).unwrap(), Some(ChunkData::new(b"b".to_vec()).encode()));
    }

    #[test]
    fn test_spawned_entity_is_indexed() {
        let (_dir, world) = setup_world();
        let id = world.spawn_entity(ChunkPos::new(4, 4)).unwrap();
        assert_eq!(world.entities().locate(&id), Some(ChunkPos::new(4, 4)));
        assert_eq!(world.load_chunk(ChunkPos::new(4, 4)).unwrap().unwrap().entities, vec![id]);
    }

    #[test]
    fn test_save_suppressed_while_restoring() {
        let (_dir, world) = setup_world();
        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        world.pre_restore(&ctx).unwrap();
        assert_eq!(world.save_all().unwrap(), SaveOutcome::Suppressed);
        assert!(world.set_chunk(ChunkPos::new(0, 0), ChunkData::default()).unwrap_err().is_restoring());
        assert!(world.metrics.snapshot().saves_suppressed >= 1);
        world.post_restore(&ctx).unwrap();
        assert_eq!(world.save_all().unwrap(), SaveOutcome::Saved(0));
    }

    #[test]
    fn test_refused_save_keeps_chunks_dirty() {
        let (_dir, world) = setup_world();
        world.set_chunk(ChunkPos::new(0, 0), ChunkData::new(b"first".to_vec())).unwrap();
        world.save_all().unwrap();

        // the worker quiesces before the world notices the restore
        let ctx = RestoreContext::new(1, Duration::from_secs(5));
        let workers = world.chunks().workers();
        assert_eq!(workers.len(), 1);
        workers[0].pre_restore(&ctx).unwrap();

        world.set_chunk(ChunkPos::new(0, 0), ChunkData::new(b"second".to_vec())).unwrap();
        assert_eq!(world.save_all().unwrap(), SaveOutcome::Suppressed);
        assert_eq!(world.dirty_count(), 1);

        workers[0].post_restore(&ctx).unwrap();
        assert_eq!(world.save_all().unwrap(), SaveOutcome::Saved(1));
        assert_eq!(world.dirty_count(), 0);
        assert_eq!(
            world.chunks().load(ChunkPos::new(0, 0)).unwrap(),
            Some(ChunkData::new(b"second".to_vec()).encode())
        );
    }

    #[test]
    fn test_pre_restore_hands_dirty_chunks_to_workers() {
        let (_dir, world) = setup_world();
        world.set_chunk(ChunkPos::new(0, 0), ChunkData::new(b"late".to_vec())).unwrap();

        let ctx = RestoreContext::new(1, Duration::from_secs(5));
        world.pre_restore(&ctx).unwrap();
        assert_eq!(world.dirty_count(), 0);
        for worker in world.chunks().workers() {
            worker.pre_restore(&ctx).unwrap();
            assert_eq!(worker.queue_depth(), 0);
            worker.post_restore(&ctx).unwrap();
        }
        world.post_restore(&ctx).unwrap();

        let chunk = world.load_chunk(ChunkPos::new(0, 0)).unwrap().unwrap();
        assert_eq!(chunk.blocks, b"late".to_vec());
    }
}
