//! Backup catalog
//!
//! The catalog maps backup ids to their partition references. It is a
//! single JSON document replaced atomically on every change:
//!
//! ```text
//! {"format_version":1,"next_id":4,"backups":[{...},{...}]}
//! ```
//!
//! In-memory state changes only after the new document is durable, so a
//! reader sees a backup either complete or not at all.

mod errors;
mod model;

pub use errors::{CatalogError, CatalogResult};
pub use model::{Backup, NewBackup, PartitionRef};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::content_store::BlobHash;
use crate::durability::write_atomic;
use crate::observability::{log_event_with_fields, Event};

pub const CATALOG_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CatalogFile {
    format_version: u32,
    next_id: u64,
    backups: Vec<Backup>,
}

struct CatalogState {
    next_id: u64,
    backups: BTreeMap<u64, Arc<Backup>>,
}

pub struct Catalog {
    path: PathBuf,
    state: RwLock<CatalogState>,
}

impl Catalog {
    /// Loads the catalog at `path`; a missing file is an empty catalog.
    pub fn open(path: impl Into<PathBuf>) -> CatalogResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| CatalogError::io(format!("reading {}", path.display()), e))?;
            let file: CatalogFile =
                serde_json::from_slice(&bytes).map_err(|e| CatalogError::Corrupt(e.to_string()))?;
            if file.format_version != CATALOG_FORMAT_VERSION {
                return Err(CatalogError::UnsupportedVersion(file.format_version));
            }
            let backups: BTreeMap<u64, Arc<Backup>> =
                file.backups.into_iter().map(|b| (b.id, Arc::new(b))).collect();
            let max_id = backups.keys().next_back().copied().unwrap_or(0);
            CatalogState {
                next_id: file.next_id.max(max_id + 1),
                backups,
            }
        } else {
            CatalogState {
                next_id: 1,
                backups: BTreeMap::new(),
            }
        };

        log_event_with_fields(
            Event::CatalogLoaded,
            &[
                ("path", &path.display().to_string()),
                ("backups", &state.backups.len().to_string()),
            ],
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    fn persist<'a, I>(&self, next_id: u64, backups: I) -> CatalogResult<()>
    where
        I: IntoIterator<Item = &'a Backup>,
    {
        let file = CatalogFile {
            format_version: CATALOG_FORMAT_VERSION,
            next_id,
            backups: backups.into_iter().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| CatalogError::Corrupt(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CatalogError::io(format!("creating {}", parent.display()), e))?;
        }
        write_atomic(&self.path, &json)
            .map_err(|e| CatalogError::io(format!("writing {}", self.path.display()), e))?;
        log_event_with_fields(
            Event::CatalogPersisted,
            &[("backups", &file.backups.len().to_string()), ("next_id", &next_id.to_string())],
        );
        Ok(())
    }

    /// Writes the current state, creating the file if it is missing.
    pub fn save(&self) -> CatalogResult<()> {
        let state = self.read();
        self.persist(state.next_id, state.backups.values().map(Arc::as_ref))
    }

    /// Assigns the next id and appends the backup.
    pub fn commit(&self, new: NewBackup) -> CatalogResult<Arc<Backup>> {
        let mut state = self.write();
        let id = state.next_id;
        let backup = Arc::new(new.into_backup(id));

        self.persist(
            id + 1,
            state.backups.values().map(Arc::as_ref).chain(std::iter::once(backup.as_ref())),
        )?;

        state.backups.insert(id, Arc::clone(&backup));
        state.next_id = id + 1;
        Ok(backup)
    }

    /// Deletes one entry by id.
    pub fn remove(&self, id: u64) -> CatalogResult<Arc<Backup>> {
        let mut state = self.write();
        let Some(removed) = state.backups.get(&id).cloned() else {
            return Err(CatalogError::NotFound(id));
        };
        self.persist(
            state.next_id,
            state.backups.values().filter(|b| b.id != id).map(Arc::as_ref),
        )?;
        state.backups.remove(&id);
        Ok(removed)
    }

    /// Records where a backup was uploaded.
    pub fn set_cloud_url(&self, id: u64, url: impl Into<String>) -> CatalogResult<Arc<Backup>> {
        let mut state = self.write();
        let Some(current) = state.backups.get(&id) else {
            return Err(CatalogError::NotFound(id));
        };
        let mut updated = Backup::clone(current);
        updated.cloud_url = Some(url.into());
        let updated = Arc::new(updated);

        self.persist(
            state.next_id,
            state
                .backups
                .values()
                .map(|b| if b.id == id { updated.as_ref() } else { b.as_ref() }),
        )?;
        state.backups.insert(id, Arc::clone(&updated));
        Ok(updated)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Backup>> {
        self.read().backups.get(&id).cloned()
    }

    /// Newest first by `created_at`, ties broken by id. An imported
    /// backup keeps its original timestamp, so it sorts among its peers
    /// rather than at the top.
    pub fn list(&self, offset: usize, limit: usize) -> Vec<Arc<Backup>> {
        newest_first(&self.read().backups)
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.read().backups.len()
    }

    pub fn latest(&self) -> Option<Arc<Backup>> {
        self.read().backups.values().max_by_key(|b| (b.created_at, b.id)).cloned()
    }

    /// Newest backup that was not taken automatically.
    pub fn latest_permanent(&self) -> Option<Arc<Backup>> {
        self.read()
            .backups
            .values()
            .filter(|b| !b.temporary)
            .max_by_key(|b| (b.created_at, b.id))
            .cloned()
    }

    /// One hash per partition reference across all backups.
    pub fn all_refs(&self) -> Vec<BlobHash> {
        self.read()
            .backups
            .values()
            .flat_map(|b| b.hashes().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Total partition bytes referenced by all backups.
    pub fn referenced_size(&self) -> u64 {
        self.read().backups.values().map(|b| b.total_size).sum()
    }

    /// On-disk bytes of the distinct blobs the catalog references.
    pub fn zipped_size(&self) -> u64 {
        let state = self.read();
        let mut sizes: HashMap<BlobHash, u64> = HashMap::new();
        for r in state.backups.values().flat_map(|b| b.partitions.iter()) {
            sizes.insert(r.hash, r.stored_size);
        }
        sizes.values().sum()
    }
}

fn newest_first(backups: &BTreeMap<u64, Arc<Backup>>) -> Vec<&Arc<Backup>> {
    let mut sorted: Vec<&Arc<Backup>> = backups.values().collect();
    sorted.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
    sorted
}
