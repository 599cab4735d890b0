//! Cloud storage provider seam
//!
//! The service treats a provider as an opaque sink and source: it hands
//! over whole backups and asks for blobs back by hash. Transport is the
//! provider's business.

use std::fs;
use std::path::PathBuf;

use crate::catalog::Backup;
use crate::content_store::{BlobHash, ContentStore};
use crate::durability::write_atomic;

use super::errors::{BackupError, BackupResult};

pub trait CloudStorageProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Uploads every blob of `backup` plus its record; returns a URL the
    /// backup can later be found at.
    fn upload_backup(&self, backup: &Backup, store: &ContentStore) -> BackupResult<String>;

    fn download_blob(&self, hash: &BlobHash) -> BackupResult<Vec<u8>>;
}

/// Provider backed by a directory, typically a mounted network share.
///
/// ```text
/// <root>/blobs/<hash>
/// <root>/backups/<id>.json
/// ```
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        self.root.join("blobs").join(hash.to_hex())
    }
}

impl CloudStorageProvider for DirectoryProvider {
    fn name(&self) -> &str {
        "directory"
    }

    fn upload_backup(&self, backup: &Backup, store: &ContentStore) -> BackupResult<String> {
        for hash in backup.unique_hashes() {
            let target = self.blob_path(&hash);
            if target.is_file() {
                continue;
            }
            let data = store.read(&hash)?;
            write_atomic(&target, &data).map_err(|e| BackupError::io_error_at_path(&target, e))?;
        }

        let record_path = self.root.join("backups").join(format!("{}.json", backup.id));
        let record = serde_json::to_vec_pretty(backup)
            .map_err(|e| BackupError::cloud(format!("serializing record: {}", e)))?;
        write_atomic(&record_path, &record).map_err(|e| BackupError::io_error_at_path(&record_path, e))?;

        Ok(format!("file://{}", record_path.display()))
    }

    fn download_blob(&self, hash: &BlobHash) -> BackupResult<Vec<u8>> {
        let path = self.blob_path(hash);
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::not_found(format!("blob {} not in {}", hash, self.root.display())))
            }
            Err(e) => Err(BackupError::io_error_at_path(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PartitionRef;
    use crate::partition::{ChunkPos, PartitionKey};
    use tempfile::TempDir;

    #[test]
    fn test_upload_then_download() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path().join("blob")).unwrap();
        let out = store.put(b"chunk").unwrap();
        let backup = Backup::for_test(
            3,
            vec![PartitionRef::from_put(PartitionKey::new("overworld", ChunkPos::new(0, 0)), &out)],
        );

        let provider = DirectoryProvider::new(dir.path().join("cloud"));
        let url = provider.upload_backup(&backup, &store).unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("3.json"));
        assert_eq!(provider.download_blob(&out.hash).unwrap(), b"chunk".to_vec());
        assert!(provider.download_blob(&BlobHash::of(b"nope")).unwrap_err().is_not_found());
    }
}
