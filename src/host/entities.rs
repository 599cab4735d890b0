//! Entity index keyed by entity UUID
//!
//! Restored chunks bring back entities with the identities they had at
//! backup time, which may collide with or orphan entries in the live
//! index. The index is therefore cleared when a restore begins and
//! rebuilt from storage when it ends.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::partition::ChunkPos;
use crate::restore::{ComponentKind, Restorable, RestoreContext, RestoreError, RestoreResult};

use super::chunk::ChunkData;
use super::chunk_manager::ChunkManager;
use super::errors::HostResult;

#[derive(Default)]
struct IndexState {
    by_id: HashMap<Uuid, ChunkPos>,
    by_chunk: HashMap<ChunkPos, BTreeSet<Uuid>>,
    generation: u64,
}

impl IndexState {
    fn insert(&mut self, id: Uuid, pos: ChunkPos) {
        if let Some(old) = self.by_id.insert(id, pos) {
            if let Some(ids) = self.by_chunk.get_mut(&old) {
                ids.remove(&id);
            }
        }
        self.by_chunk.entry(pos).or_default().insert(id);
    }
}

pub struct EntityIndex {
    chunks: Arc<ChunkManager>,
    state: RwLock<IndexState>,
}

impl EntityIndex {
    pub fn new(chunks: Arc<ChunkManager>) -> Self {
        Self {
            chunks,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Replaces the index entries of one chunk.
    pub fn index_chunk(&self, pos: ChunkPos, entities: &[Uuid]) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = state.by_chunk.remove(&pos) {
            for id in old {
                if state.by_id.get(&id) == Some(&pos) {
                    state.by_id.remove(&id);
                }
            }
        }
        for id in entities {
            state.insert(*id, pos);
        }
    }

    pub fn locate(&self, id: &Uuid) -> Option<ChunkPos> {
        self.state.read().unwrap_or_else(|p| p.into_inner()).by_id.get(id).copied()
    }

    pub fn entities_in(&self, pos: ChunkPos) -> Vec<Uuid> {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .by_chunk
            .get(&pos)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|p| p.into_inner()).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every rebuild.
    pub fn generation(&self) -> u64 {
        self.state.read().unwrap_or_else(|p| p.into_inner()).generation
    }

    /// Reindexes every chunk of every open region.
    pub fn rebuild(&self) -> HostResult<usize> {
        let generation = self.generation() + 1;
        let mut fresh = IndexState {
            generation,
            ..IndexState::default()
        };
        for (pos, bytes) in self.chunks.snapshot_all()? {
            for id in ChunkData::decode(pos, &bytes)?.entities {
                fresh.insert(id, pos);
            }
        }
        let count = fresh.by_id.len();
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = fresh;
        Ok(count)
    }
}

impl Restorable for EntityIndex {
    fn kind(&self) -> ComponentKind {
        ComponentKind::EntityIndex
    }

    fn label(&self) -> String {
        format!("entities:{}", self.chunks.world())
    }

    fn pre_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.by_id.clear();
        state.by_chunk.clear();
        Ok(())
    }

    /// Runs after the chunk manager's workers resumed.
    fn post_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.rebuild()
            .map(|_| ())
            .map_err(|e| RestoreError::failed(format!("rebuilding entity index: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::DatasetLayout;
    use crate::worker::WorkerConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_index_chunk_moves_entity() {
        let dir = TempDir::new().unwrap();
        let chunks = Arc::new(ChunkManager::new("overworld", DatasetLayout::new(dir.path()), WorkerConfig::default()));
        let index = EntityIndex::new(chunks);
        let id = Uuid::new_v4();

        index.index_chunk(ChunkPos::new(0, 0), &[id]);
        index.index_chunk(ChunkPos::new(0, 1), &[id]);
        assert_eq!(index.locate(&id), Some(ChunkPos::new(0, 1)));
        assert!(index.entities_in(ChunkPos::new(0, 0)).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_restore_rebuilds_from_storage() {
        let dir = TempDir::new().unwrap();
        let chunks = Arc::new(ChunkManager::new("overworld", DatasetLayout::new(dir.path()), WorkerConfig::default()));
        let stored = Uuid::new_v4();
        let stale = Uuid::new_v4();
        chunks
            .store(ChunkPos::new(2, 2), ChunkData::new(b"b".to_vec()).with_entity(stored).encode())
            .unwrap()
            .wait()
            .unwrap();

        let index = EntityIndex::new(Arc::clone(&chunks));
        index.index_chunk(ChunkPos::new(9, 9), &[stale]);

        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        index.pre_restore(&ctx).unwrap();
        assert!(index.is_empty());
        index.post_restore(&ctx).unwrap();

        assert_eq!(index.locate(&stored), Some(ChunkPos::new(2, 2)));
        assert_eq!(index.locate(&stale), None);
        assert_eq!(index.generation(), 1);
    }
}
