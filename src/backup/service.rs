//! BackupDatabaseService
//!
//! Create, restore, delete and garbage collection are serialized by a
//! busy flag; a second concurrent call fails fast with `RV_BACKUP_BUSY`
//! instead of queueing. Reads (`list_backups`, `get_backup`, `check`,
//! `status`) never take the flag.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{Backup, Catalog, NewBackup, PartitionRef};
use crate::config::Config;
use crate::content_store::{BlobError, BlobHash, ContentStore, SweepReport};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, MetricsSnapshot, ObservationScope};
use crate::partition::RestoreScope;
use crate::restore::{RestoreCoordinator, RestorePhase, RestoreReport};
use crate::retry::RetryPolicy;

use super::archive::{self, ArchiveSummary};
use super::cloud::CloudStorageProvider;
use super::errors::{BackupError, BackupResult};
use super::{LiveDataset, PartitionSource};

/// Per-call restore settings.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Restore even if a referenced blob fails verification
    pub force: bool,
    pub scope: RestoreScope,
    /// Overrides `safety_backup_before_restore` from the config
    pub safety_backup: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub backups: usize,
    pub latest_backup: Option<u64>,
    pub latest_backup_at: Option<DateTime<Utc>>,
    pub blobs: usize,
    pub blob_bytes: u64,
    /// Partition bytes referenced by all backups, before deduplication
    pub referenced_bytes: u64,
    /// On-disk bytes of the blobs backups reference, after compression
    pub zipped_size: u64,
    pub restore_phase: String,
    pub busy: bool,
    pub cloud_provider: Option<String>,
    pub metrics: MetricsSnapshot,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BackupDatabaseService {
    store: ContentStore,
    catalog: Catalog,
    coordinator: RestoreCoordinator,
    busy: AtomicBool,
    cloud: OnceLock<Arc<dyn CloudStorageProvider>>,
    metrics: Arc<MetricsRegistry>,
    verify_before_restore: bool,
    safety_backup_before_restore: bool,
    ignored_worlds: Vec<String>,
    retry: RetryPolicy,
}

impl BackupDatabaseService {
    /// Opens the blob store and catalog under the configured state dir and
    /// rebuilds blob reference counts from the catalog.
    pub fn open(config: &Config) -> BackupResult<Self> {
        let store = ContentStore::open(config.blob_path())?;
        let catalog = Catalog::open(config.catalog_path())?;
        store.rebuild_refs(catalog.all_refs().iter());

        let metrics = Arc::new(MetricsRegistry::new());
        let coordinator = RestoreCoordinator::new(config.layout(), config.drain_timeout(), Arc::clone(&metrics))
            .with_preserved_worlds(config.ignored_worlds.clone())
            .with_retry(config.retry_policy());

        Ok(Self {
            store,
            catalog,
            coordinator,
            busy: AtomicBool::new(false),
            cloud: OnceLock::new(),
            metrics,
            verify_before_restore: config.verify_before_restore,
            safety_backup_before_restore: config.safety_backup_before_restore,
            ignored_worlds: config.ignored_worlds.clone(),
            retry: config.retry_policy(),
        })
    }

    fn begin(&self) -> BackupResult<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BackupError::busy())?;
        Ok(BusyGuard(&self.busy))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RestoreCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Snapshots every partition `source` yields into a new backup.
    ///
    /// All-or-nothing: if any partition fails to serialize or store, no
    /// catalog entry is written and blobs this call added are removed.
    pub fn create_backup<S: PartitionSource + ?Sized>(
        &self,
        source: &S,
        comment: Option<String>,
    ) -> BackupResult<Arc<Backup>> {
        let _guard = self.begin()?;
        self.create_backup_locked(source, comment, false)
    }

    /// Same as `create_backup`, flagged as an automatic backup.
    pub fn create_temporary_backup<S: PartitionSource + ?Sized>(
        &self,
        source: &S,
        comment: String,
    ) -> BackupResult<Arc<Backup>> {
        let _guard = self.begin()?;
        self.create_backup_locked(source, Some(comment), true)
    }

    fn create_backup_locked<S: PartitionSource + ?Sized>(
        &self,
        source: &S,
        comment: Option<String>,
        temporary: bool,
    ) -> BackupResult<Arc<Backup>> {
        let comment_field = comment.clone().unwrap_or_default();
        let scope = ObservationScope::with_fields(
            "BACKUP",
            &[("comment", &comment_field), ("temporary", if temporary { "true" } else { "false" })],
        );

        let mut created: Vec<BlobHash> = Vec::new();
        let result = self.store_partitions(source, &mut created).and_then(|(refs, stored)| {
            let new = NewBackup::new(comment, refs).temporary(temporary).stored_size(stored);
            self.catalog.commit(new).map_err(BackupError::from)
        });

        let backup = match result {
            Ok(backup) => backup,
            Err(err) => {
                for hash in &created {
                    let _ = self.store.discard_if_unreferenced(hash);
                }
                self.metrics.increment_backup_failures();
                log_event_with_fields(Event::BackupFailed, &[("error", &err.to_string())]);
                scope.fail(err.message());
                return Err(err);
            }
        };

        for r in &backup.partitions {
            self.store.retain(&r.hash)?;
        }

        self.metrics.increment_backups();
        log_event_with_fields(
            Event::BackupComplete,
            &[
                ("backup_id", &backup.id.to_string()),
                ("partitions", &backup.partitions.len().to_string()),
                ("stored_size", &backup.stored_size.to_string()),
            ],
        );
        scope.complete_with_fields(&[("backup_id", &backup.id.to_string())]);
        Ok(backup)
    }

    fn store_partitions<S: PartitionSource + ?Sized>(
        &self,
        source: &S,
        created: &mut Vec<BlobHash>,
    ) -> BackupResult<(Vec<PartitionRef>, u64)> {
        let partitions = source.serialize_partitions()?;
        let mut refs = Vec::with_capacity(partitions.len());
        let mut stored = 0u64;

        for (partition, data) in partitions {
            if self.ignored_worlds.iter().any(|w| *w == partition.world) {
                continue;
            }
            let out = self
                .retry
                .run("blob put", BlobError::is_transient, || self.store.put(&data))?;
            self.metrics.record_blob_put(out.size, out.created);
            if out.created {
                created.push(out.hash);
                stored += out.stored_size;
            }
            refs.push(PartitionRef::from_put(partition, &out));
        }
        refs.sort_by(|a, b| a.partition.cmp(&b.partition));
        Ok((refs, stored))
    }

    // ------------------------------------------------------------------
    // Catalog queries
    // ------------------------------------------------------------------

    /// Newest first.
    pub fn list_backups(&self, offset: usize, limit: usize) -> Vec<Arc<Backup>> {
        self.catalog.list(offset, limit)
    }

    pub fn backup_count(&self) -> usize {
        self.catalog.count()
    }

    pub fn get_backup(&self, id: u64) -> Option<Arc<Backup>> {
        self.catalog.get(id)
    }

    pub fn latest_backup(&self) -> Option<Arc<Backup>> {
        self.catalog.latest()
    }

    pub fn latest_permanent_backup(&self) -> Option<Arc<Backup>> {
        self.catalog.latest_permanent()
    }

    fn require(&self, id: u64) -> BackupResult<Arc<Backup>> {
        self.catalog
            .get(id)
            .ok_or_else(|| BackupError::not_found(format!("backup #{} not found", id)))
    }

    /// Resolves a blob to its file for read-only access.
    pub fn blob_file(&self, hash: &BlobHash) -> BackupResult<std::path::PathBuf> {
        Ok(self.store.get(hash)?)
    }

    /// True when every referenced blob exists and still matches its hash.
    pub fn check(&self, backup: &Backup) -> BackupResult<bool> {
        for hash in backup.unique_hashes() {
            match self.store.check(&hash) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(BlobError::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    pub fn status(&self) -> BackupResult<ServiceStatus> {
        let latest = self.catalog.latest();
        Ok(ServiceStatus {
            backups: self.catalog.count(),
            latest_backup: latest.as_ref().map(|b| b.id),
            latest_backup_at: latest.as_ref().map(|b| b.created_at),
            blobs: self.store.list()?.len(),
            blob_bytes: self.store.disk_usage()?,
            referenced_bytes: self.catalog.referenced_size(),
            zipped_size: self.catalog.zipped_size(),
            restore_phase: self.coordinator.phase().as_str().to_string(),
            busy: self.is_busy(),
            cloud_provider: self.cloud.get().map(|p| p.name().to_string()),
            metrics: self.metrics.snapshot(),
        })
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Restores `id` into the running `dataset`.
    ///
    /// Order: fetch missing blobs from the cloud provider, verify (unless
    /// forced), take a temporary safety backup, then run the coordinator.
    pub fn restore_backup(
        &self,
        id: u64,
        dataset: &dyn LiveDataset,
        options: &RestoreOptions,
    ) -> BackupResult<RestoreReport> {
        let _guard = self.begin()?;
        let backup = self.require(id)?;

        log_event_with_fields(
            Event::RestoreStart,
            &[("backup_id", &id.to_string()), ("force", if options.force { "true" } else { "false" })],
        );

        self.hydrate(&backup)?;

        if self.verify_before_restore && !options.force && !self.check(&backup)? {
            return Err(BackupError::integrity(format!(
                "backup #{} failed verification; use force to restore anyway",
                id
            )));
        }

        if options.safety_backup.unwrap_or(self.safety_backup_before_restore) {
            let comment = format!("Auto-backup before restoring to #{}", id);
            self.create_backup_locked(dataset, Some(comment), true)?;
        }

        let report = self
            .coordinator
            .restore(dataset.restore_root(), &backup, &self.store, &options.scope)?;
        Ok(report)
    }

    /// Downloads blobs the store lacks, when a provider is set.
    fn hydrate(&self, backup: &Backup) -> BackupResult<usize> {
        let Some(provider) = self.cloud.get() else {
            return Ok(0);
        };
        let mut fetched = 0;
        for hash in backup.unique_hashes() {
            if self.store.contains(&hash) {
                continue;
            }
            let data = provider.download_blob(&hash)?;
            let out = self.store.put(&data)?;
            if out.hash != hash {
                let _ = self.store.discard_if_unreferenced(&out.hash);
                return Err(BackupError::integrity(format!(
                    "downloaded blob {} hashes to {}",
                    hash, out.hash
                )));
            }
            fetched += 1;
            log_event_with_fields(Event::BlobDownloaded, &[("hash", &hash.to_hex())]);
        }
        Ok(fetched)
    }

    pub fn restore_phase(&self) -> RestorePhase {
        self.coordinator.phase()
    }

    /// Resumes every component after an inconsistent restore.
    pub fn force_resume(&self, dataset: &dyn LiveDataset) -> BackupResult<usize> {
        let _guard = self.begin()?;
        Ok(self.coordinator.force_resume(dataset.restore_root())?)
    }

    // ------------------------------------------------------------------
    // Delete and maintenance
    // ------------------------------------------------------------------

    /// Removes the catalog entry, then releases each blob reference.
    pub fn delete_backup(&self, id: u64) -> BackupResult<Arc<Backup>> {
        let _guard = self.begin()?;
        let backup = self.catalog.remove(id)?;

        let mut removed = 0usize;
        let mut first_err: Option<BackupError> = None;
        for r in &backup.partitions {
            match self.store.release(&r.hash) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e.into());
                }
            }
        }

        self.metrics.increment_deletions();
        log_event_with_fields(
            Event::BackupDeleted,
            &[("backup_id", &id.to_string()), ("blobs_removed", &removed.to_string())],
        );
        match first_err {
            // the entry is gone; leftovers are swept by `collect_garbage`
            Some(e) => Err(e),
            None => Ok(backup),
        }
    }

    /// Rebuilds reference counts from the catalog and removes every blob
    /// nothing references.
    pub fn collect_garbage(&self) -> BackupResult<SweepReport> {
        let _guard = self.begin()?;
        self.store.rebuild_refs(self.catalog.all_refs().iter());
        Ok(self.store.sweep_unreferenced()?)
    }

    // ------------------------------------------------------------------
    // Cloud
    // ------------------------------------------------------------------

    /// Installs the process-wide provider. A second call fails.
    pub fn set_cloud_storage_provider(&self, provider: Arc<dyn CloudStorageProvider>) -> BackupResult<()> {
        self.cloud
            .set(provider)
            .map_err(|_| BackupError::cloud("cloud storage provider already set"))
    }

    pub fn cloud_storage_provider(&self) -> Option<Arc<dyn CloudStorageProvider>> {
        self.cloud.get().cloned()
    }

    pub fn upload_backup(&self, id: u64) -> BackupResult<Arc<Backup>> {
        let provider = self
            .cloud
            .get()
            .ok_or_else(|| BackupError::cloud("no cloud storage provider set"))?;
        let backup = self.require(id)?;
        let url = provider.upload_backup(&backup, &self.store)?;
        let updated = self.catalog.set_cloud_url(id, url.clone())?;
        log_event_with_fields(
            Event::BackupUploaded,
            &[("backup_id", &id.to_string()), ("provider", provider.name()), ("url", &url)],
        );
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Archive
    // ------------------------------------------------------------------

    /// Streams backup `id` into `writer` as a tar archive.
    pub fn export_archive<W: Write>(&self, id: u64, writer: W) -> BackupResult<(W, ArchiveSummary)> {
        let backup = self.require(id)?;
        let (writer, summary) = archive::write_archive(writer, &backup, &self.store)?;
        log_event_with_fields(
            Event::BackupExported,
            &[("backup_id", &id.to_string()), ("blobs", &summary.blobs.to_string())],
        );
        Ok((writer, summary))
    }

    /// Reads an exported archive and appends it as a new backup. The new
    /// entry keeps the original timestamp and comment but gets a new id.
    pub fn import_archive<R: Read>(&self, reader: R) -> BackupResult<Arc<Backup>> {
        let _guard = self.begin()?;
        let imported = archive::read_archive(reader, &self.store)?;
        let record = imported.record;
        let stored = imported
            .created
            .iter()
            .map(|h| self.store.stored_size(h).unwrap_or(0));
        // the local store decides how each blob is kept
        let partitions = record
            .partitions
            .iter()
            .map(|r| PartitionRef {
                stored_size: self.store.stored_size(&r.hash).unwrap_or(r.stored_size),
                compressed: self.store.is_compressed(&r.hash),
                ..r.clone()
            })
            .collect();
        let new = NewBackup::new(record.comment.clone(), partitions)
            .created_at(record.created_at)
            .temporary(record.temporary)
            .stored_size(stored.sum());

        let backup = match self.catalog.commit(new) {
            Ok(backup) => backup,
            Err(e) => {
                for hash in &imported.created {
                    let _ = self.store.discard_if_unreferenced(hash);
                }
                return Err(e.into());
            }
        };
        for r in &backup.partitions {
            self.store.retain(&r.hash)?;
        }
        log_event_with_fields(
            Event::BackupImported,
            &[
                ("backup_id", &backup.id.to_string()),
                ("original_id", &record.id.to_string()),
                ("blobs", &imported.summary.blobs.to_string()),
            ],
        );
        Ok(backup)
    }
}
