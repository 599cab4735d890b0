//! File-backed shard storage with restore hooks

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::observability::{log_event_with_fields, Event};
use crate::partition::{ChunkPos, ShardKey};
use crate::restore::{ComponentKind, Restorable, RestoreContext, RestoreResult};

use super::errors::{RegionError, RegionResult};
use super::file::RegionFile;
use super::ShardStorage;

/// One region file, opened lazily on first access.
///
/// While restoring, writes are dropped as successful no-ops and reads
/// fail with `Closed`; the handle is closed and only reopened after
/// `post_restore`, so the next access sees the swapped file.
#[derive(Debug)]
pub struct RegionStorage {
    shard: ShardKey,
    path: PathBuf,
    file: Mutex<Option<RegionFile>>,
    restoring: AtomicBool,
}

impl RegionStorage {
    pub fn new(shard: ShardKey, path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            shard,
            path: path.into(),
            file: Mutex::new(None),
            restoring: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shard(&self) -> &ShardKey {
        &self.shard
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Option<RegionFile>> {
        self.file.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Runs `f` against the open file, opening it first. Returns `None`
    /// without creating anything when the file does not exist and
    /// `create` is false.
    fn with_file<T>(
        &self,
        create: bool,
        f: impl FnOnce(&mut RegionFile) -> RegionResult<T>,
    ) -> RegionResult<Option<T>> {
        let mut guard = self.lock();
        if guard.is_none() {
            if !create && !self.path.exists() {
                return Ok(None);
            }
            *guard = Some(RegionFile::open(&self.path, create)?);
        }
        match guard.as_mut() {
            Some(file) => f(file).map(Some),
            None => Err(RegionError::Closed(self.shard.to_string())),
        }
    }
}

impl ShardStorage for RegionStorage {
    fn shard(&self) -> &ShardKey {
        &self.shard
    }

    fn read(&self, pos: ChunkPos) -> RegionResult<Option<Vec<u8>>> {
        if self.is_restoring() {
            return Err(RegionError::Closed(self.shard.to_string()));
        }
        Ok(self
            .with_file(false, |file| file.read(pos.local_index()))?
            .flatten())
    }

    fn write(&self, pos: ChunkPos, data: &[u8]) -> RegionResult<()> {
        if self.is_restoring() {
            log_event_with_fields(
                Event::SaveSuppressed,
                &[("shard", &self.shard.to_string()), ("chunk", &pos.to_string())],
            );
            return Ok(());
        }
        self.with_file(true, |file| file.write(pos.local_index(), data))?;
        Ok(())
    }

    fn entries(&self) -> RegionResult<Vec<(ChunkPos, Vec<u8>)>> {
        if self.is_restoring() {
            return Err(RegionError::Closed(self.shard.to_string()));
        }
        let region = self.shard.region;
        let entries = self.with_file(false, |file| file.entries())?.unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|(slot, data)| (ChunkPos::from_local(region, slot), data))
            .collect())
    }

    fn sync(&self) -> RegionResult<()> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }
}

impl Restorable for RegionStorage {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Storage
    }

    fn label(&self) -> String {
        format!("storage:{}", self.shard)
    }

    fn pre_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.restoring.store(true, Ordering::SeqCst);
        // never-opened storage has nothing to close
        if let Some(mut file) = self.lock().take() {
            let _ = file.sync();
        }
        Ok(())
    }

    fn post_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.lock().take();
        self.restoring.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::RegionPos;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup_storage() -> (TempDir, Arc<RegionStorage>) {
        let dir = TempDir::new().unwrap();
        let shard = ShardKey::new("overworld", RegionPos::new(0, 0));
        let storage = RegionStorage::new(shard, dir.path().join("region").join("r.0.0.rgn"));
        (dir, storage)
    }

    #[test]
    fn test_read_without_file_is_none_and_creates_nothing() {
        let (_dir, storage) = setup_storage();
        assert_eq!(storage.read(ChunkPos::new(1, 1)).unwrap(), None);
        assert!(!storage.path().exists());
        assert!(!storage.is_open());
    }

    #[test]
    fn test_write_then_entries() {
        let (_dir, storage) = setup_storage();
        storage.write(ChunkPos::new(1, 2), b"a").unwrap();
        storage.write(ChunkPos::new(3, 4), b"b").unwrap();

        let entries = storage.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&(ChunkPos::new(3, 4), b"b".to_vec())));
    }

    #[test]
    fn test_restore_hooks_close_and_suppress() {
        let (_dir, storage) = setup_storage();
        storage.write(ChunkPos::new(0, 0), b"before").unwrap();
        assert!(storage.is_open());

        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        storage.pre_restore(&ctx).unwrap();
        assert!(!storage.is_open());

        storage.write(ChunkPos::new(0, 0), b"suppressed").unwrap();
        assert!(matches!(storage.read(ChunkPos::new(0, 0)), Err(RegionError::Closed(_))));

        storage.post_restore(&ctx).unwrap();
        assert_eq!(storage.read(ChunkPos::new(0, 0)).unwrap().unwrap(), b"before");
    }

    #[test]
    fn test_hooks_on_never_opened_storage_are_noops() {
        let (_dir, storage) = setup_storage();
        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        storage.pre_restore(&ctx).unwrap();
        storage.post_restore(&ctx).unwrap();
        assert!(!storage.path().exists());
    }
}
