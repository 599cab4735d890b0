//! Server: the root of the restorable tree
//!
//! ```text
//! server
//! └── world
//!     ├── chunk manager
//!     │   └── persistence worker (one per region)
//!     │       └── region storage
//!     ├── ticket manager
//!     └── entity index
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::backup::{BackupResult, LiveDataset, PartitionSource};
use crate::config::Config;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::partition::{DatasetLayout, PartitionKey};
use crate::restore::{ComponentKind, Restorable, RestoreContext, RestoreResult};
use crate::worker::WorkerConfig;

use super::errors::{HostError, HostResult};
use super::world::{SaveOutcome, World};

/// The part of the server the coordinator walks.
pub struct ServerRoot {
    worlds: RwLock<BTreeMap<String, Arc<World>>>,
    restoring: AtomicBool,
}

impl ServerRoot {
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<World>>> {
        self.worlds.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }
}

impl Restorable for ServerRoot {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Server
    }

    fn label(&self) -> String {
        "server".to_string()
    }

    fn pre_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        let _worlds = self.worlds.write().unwrap_or_else(|p| p.into_inner());
        self.restoring.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn post_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.restoring.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn children(&self) -> Vec<Arc<dyn Restorable>> {
        self.read()
            .values()
            .map(|w| Arc::clone(w) as Arc<dyn Restorable>)
            .collect()
    }
}

pub struct Server {
    layout: DatasetLayout,
    worker_config: WorkerConfig,
    metrics: Arc<MetricsRegistry>,
    root: Arc<ServerRoot>,
}

impl Server {
    /// Empty server over `layout`; worlds are added explicitly.
    pub fn new(layout: DatasetLayout, worker_config: WorkerConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            layout,
            worker_config,
            metrics,
            root: Arc::new(ServerRoot {
                worlds: RwLock::new(BTreeMap::new()),
                restoring: AtomicBool::new(false),
            }),
        }
    }

    /// Opens every world found under the data directory.
    pub fn open(config: &Config, metrics: Arc<MetricsRegistry>) -> HostResult<Self> {
        let server = Self::new(config.layout(), config.worker_config(), metrics);
        let worlds = server
            .layout
            .list_worlds()
            .map_err(|e| HostError::io(server.layout.root(), e))?;
        for name in worlds {
            server.add_world(&name)?.chunks().open_on_disk()?;
        }
        Ok(server)
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub fn is_restoring(&self) -> bool {
        self.root.is_restoring()
    }

    pub fn add_world(&self, name: &str) -> HostResult<Arc<World>> {
        let mut worlds = self.root.worlds.write().unwrap_or_else(|p| p.into_inner());
        if self.root.is_restoring() {
            return Err(HostError::Restoring("server".to_string()));
        }
        if worlds.contains_key(name) {
            return Err(HostError::WorldExists(name.to_string()));
        }
        let world = Arc::new(World::new(
            name,
            self.layout.clone(),
            self.worker_config.clone(),
            Arc::clone(&self.metrics),
        ));
        worlds.insert(name.to_string(), Arc::clone(&world));
        Ok(world)
    }

    pub fn world(&self, name: &str) -> HostResult<Arc<World>> {
        self.root
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::UnknownWorld(name.to_string()))
    }

    pub fn worlds(&self) -> Vec<Arc<World>> {
        self.root.read().values().cloned().collect()
    }

    /// Saves every world. Suppressed as a whole while a restore runs.
    pub fn autosave(&self) -> HostResult<SaveOutcome> {
        if self.is_restoring() {
            self.metrics.increment_saves_suppressed();
            log_event_with_fields(Event::SaveSuppressed, &[("scope", "server")]);
            return Ok(SaveOutcome::Suppressed);
        }
        let mut saved = 0;
        for world in self.worlds() {
            match world.save_all()? {
                SaveOutcome::Saved(n) => saved += n,
                SaveOutcome::Suppressed => return Ok(SaveOutcome::Suppressed),
            }
        }
        Ok(SaveOutcome::Saved(saved))
    }
}

impl PartitionSource for Server {
    fn serialize_partitions(&self) -> BackupResult<Vec<(PartitionKey, Vec<u8>)>> {
        if self.is_restoring() {
            return Err(HostError::Restoring("server".to_string()).into());
        }
        let mut out = Vec::new();
        for world in self.worlds() {
            if world.save_all()? == SaveOutcome::Suppressed {
                return Err(HostError::Restoring(world.label()).into());
            }
            for (pos, bytes) in world.chunks().snapshot_all()? {
                out.push((PartitionKey::new(world.name(), pos), bytes));
            }
        }
        Ok(out)
    }
}

impl LiveDataset for Server {
    fn restore_root(&self) -> Arc<dyn Restorable> {
        Arc::clone(&self.root) as Arc<dyn Restorable>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ChunkData;
    use crate::partition::ChunkPos;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup_server() -> (TempDir, Server) {
        let dir = TempDir::new().unwrap();
        let server = Server::new(
            DatasetLayout::new(dir.path()),
            WorkerConfig::default(),
            Arc::new(MetricsRegistry::new()),
        );
        (dir, server)
    }

    #[test]
    fn test_add_world_twice_fails() {
        let (_dir, server) = setup_server();
        server.add_world("overworld").unwrap();
        assert!(matches!(server.add_world("overworld"), Err(HostError::WorldExists(_))));
        assert!(matches!(server.world("nether"), Err(HostError::UnknownWorld(_))));
    }

    #[test]
    fn test_serialize_includes_unsaved_chunks() {
        let (_dir, server) = setup_server();
        let world = server.add_world("overworld").unwrap();
        world.set_chunk(ChunkPos::new(0, 0), ChunkData::new(b"x".to_vec())).unwrap();

        let partitions = server.serialize_partitions().unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].0, PartitionKey::new("overworld", ChunkPos::new(0, 0)));
        assert_eq!(partitions[0].1, ChunkData::new(b"x".to_vec()).encode());
    }

    #[test]
    fn test_autosave_suppressed_while_restoring() {
        let (_dir, server) = setup_server();
        server.add_world("overworld").unwrap();
        let root = server.restore_root();
        let ctx = RestoreContext::new(1, Duration::from_secs(1));

        root.pre_restore(&ctx).unwrap();
        assert_eq!(server.autosave().unwrap(), SaveOutcome::Suppressed);
        assert!(server.add_world("nether").unwrap_err().is_restoring());
        root.post_restore(&ctx).unwrap();
        assert_eq!(server.autosave().unwrap(), SaveOutcome::Saved(0));
    }

    #[test]
    fn test_open_discovers_worlds() {
        let (dir, server) = setup_server();
        let world = server.add_world("overworld").unwrap();
        world.set_chunk(ChunkPos::new(0, 0), ChunkData::new(b"x".to_vec())).unwrap();
        world.flush_all().unwrap();
        drop(world);
        drop(server);

        let config = Config::for_data_dir(dir.path());
        let reopened = Server::open(&config, Arc::new(MetricsRegistry::new())).unwrap();
        assert_eq!(reopened.worlds().len(), 1);
        assert_eq!(reopened.restore_root().children().len(), 1);
    }
}
