//! Backup database service
//!
//! Entry point for creating, listing, verifying, restoring and deleting
//! backups. Data movement is delegated:
//!
//! - partition bytes go to the `ContentStore`, one blob per distinct content
//! - backup records go to the `Catalog`
//! - restores go to the `RestoreCoordinator`
//!
//! The live dataset is reached through two traits so the service never
//! depends on the host's concrete types.

mod archive;
pub mod cloud;
mod errors;
pub mod scheduler;
mod service;

pub use archive::{ArchiveSummary, BLOB_PREFIX, RECORD_ENTRY};
pub use cloud::{CloudStorageProvider, DirectoryProvider};
pub use errors::{BackupError, BackupErrorCode, BackupResult, Severity};
pub use service::{BackupDatabaseService, RestoreOptions, ServiceStatus};

use std::sync::Arc;

use crate::partition::PartitionKey;
use crate::restore::Restorable;

/// Anything that can hand over every partition's serialized bytes.
pub trait PartitionSource {
    /// Flushes pending state, then serializes every partition. One
    /// failing partition fails the whole call.
    fn serialize_partitions(&self) -> BackupResult<Vec<(PartitionKey, Vec<u8>)>>;
}

/// A running dataset that can be both backed up and restored.
pub trait LiveDataset: PartitionSource + Send + Sync {
    /// Root of the restorable component tree.
    fn restore_root(&self) -> Arc<dyn Restorable>;
}
