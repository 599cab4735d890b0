//! Tar export and import of a single backup
//!
//! Archive layout, independent of the content store's directory layout:
//!
//! ```text
//! backup.json          catalog record
//! blobs/<sha256 hex>   one entry per distinct blob, sorted by hash
//! ```
//!
//! Plain tar, no compression.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use tar::{Archive, Builder, Header};

use crate::catalog::Backup;
use crate::content_store::{BlobHash, ContentStore};

use super::errors::{BackupError, BackupResult};

pub const RECORD_ENTRY: &str = "backup.json";
pub const BLOB_PREFIX: &str = "blobs/";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub blobs: usize,
    pub bytes: u64,
}

/// What an import read: the original record and the blobs it added.
#[derive(Debug)]
pub struct ImportedArchive {
    pub record: Backup,
    /// Blobs newly written to the store by this import
    pub created: Vec<BlobHash>,
    pub summary: ArchiveSummary,
}

fn tar_error(context: &str, e: std::io::Error) -> BackupError {
    BackupError::io_error(format!("archive: {}", context), e)
}

/// Streams `backup` into `writer` as a tar archive and returns the writer.
pub fn write_archive<W: Write>(writer: W, backup: &Backup, store: &ContentStore) -> BackupResult<(W, ArchiveSummary)> {
    let mut builder = Builder::new(writer);
    let mtime = backup.created_at.timestamp().max(0) as u64;

    let record = serde_json::to_vec_pretty(backup)
        .map_err(|e| BackupError::failed(format!("serializing backup record: {}", e)))?;
    let mut header = Header::new_gnu();
    header.set_size(record.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder
        .append_data(&mut header, RECORD_ENTRY, record.as_slice())
        .map_err(|e| tar_error("writing record", e))?;

    let mut summary = ArchiveSummary::default();
    for hash in backup.unique_hashes() {
        // verified read: a corrupt blob never leaves the store
        let data = store.read(&hash)?;
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}{}", BLOB_PREFIX, hash), data.as_slice())
            .map_err(|e| tar_error(&format!("writing blob {}", hash), e))?;
        summary.blobs += 1;
        summary.bytes += data.len() as u64;
    }

    let writer = builder.into_inner().map_err(|e| tar_error("finishing", e))?;
    Ok((writer, summary))
}

/// Reads an archive into `store`. On error, blobs this call created are
/// removed again unless something references them.
pub fn read_archive<R: Read>(reader: R, store: &ContentStore) -> BackupResult<ImportedArchive> {
    let mut created = Vec::new();
    match read_entries(reader, store, &mut created) {
        Ok((record, summary)) => Ok(ImportedArchive {
            record,
            created,
            summary,
        }),
        Err(e) => {
            for hash in &created {
                let _ = store.discard_if_unreferenced(hash);
            }
            Err(e)
        }
    }
}

fn read_entries<R: Read>(
    reader: R,
    store: &ContentStore,
    created: &mut Vec<BlobHash>,
) -> BackupResult<(Backup, ArchiveSummary)> {
    let mut archive = Archive::new(reader);
    let mut record: Option<Backup> = None;
    let mut present: BTreeSet<BlobHash> = BTreeSet::new();
    let mut summary = ArchiveSummary::default();

    for entry in archive.entries().map_err(|e| tar_error("reading entries", e))? {
        let mut entry = entry.map_err(|e| tar_error("reading entry", e))?;
        let path = entry
            .path()
            .map_err(|e| tar_error("reading entry path", e))?
            .to_string_lossy()
            .into_owned();

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| tar_error(&format!("reading {}", path), e))?;

        if path == RECORD_ENTRY {
            let parsed: Backup = serde_json::from_slice(&data)
                .map_err(|e| BackupError::archive(format!("invalid {}: {}", RECORD_ENTRY, e)))?;
            record = Some(parsed);
        } else if let Some(hex) = path.strip_prefix(BLOB_PREFIX) {
            let expected: BlobHash = hex
                .parse()
                .map_err(|_| BackupError::archive(format!("invalid blob entry name '{}'", path)))?;
            let actual = BlobHash::of(&data);
            if actual != expected {
                return Err(BackupError::archive(format!("blob {} hashes to {}", expected, actual)));
            }
            let out = store.put(&data)?;
            if out.created {
                created.push(out.hash);
            }
            present.insert(out.hash);
            summary.blobs += 1;
            summary.bytes += out.size;
        } else {
            return Err(BackupError::archive(format!("unexpected entry '{}'", path)));
        }
    }

    let record = record.ok_or_else(|| BackupError::archive(format!("missing {}", RECORD_ENTRY)))?;
    let missing: Vec<String> = record
        .unique_hashes()
        .into_iter()
        .filter(|h| !present.contains(h) && !store.contains(h))
        .map(|h| h.to_hex())
        .collect();
    if !missing.is_empty() {
        return Err(BackupError::archive(format!(
            "{} referenced blob(s) missing, first {}",
            missing.len(),
            missing[0]
        )));
    }
    Ok((record, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PartitionRef;
    use crate::partition::{ChunkPos, PartitionKey};
    use tempfile::TempDir;

    fn setup_backup(store: &ContentStore) -> Backup {
        let mut parts = Vec::new();
        for (x, data) in [(0, &b"alpha"[..]), (1, &b"beta"[..]), (2, &b"alpha"[..])] {
            let out = store.put(data).unwrap();
            parts.push(PartitionRef::from_put(PartitionKey::new("overworld", ChunkPos::new(x, 0)), &out));
        }
        Backup::for_test(7, parts)
    }

    #[test]
    fn test_export_then_import_into_fresh_store() {
        let dir = TempDir::new().unwrap();
        let source = ContentStore::open(dir.path().join("a")).unwrap();
        let backup = setup_backup(&source);

        let (bytes, summary) = write_archive(Vec::new(), &backup, &source).unwrap();
        assert_eq!(summary.blobs, 2);

        let target = ContentStore::open(dir.path().join("b")).unwrap();
        let imported = read_archive(bytes.as_slice(), &target).unwrap();
        assert_eq!(imported.record, backup);
        assert_eq!(imported.created.len(), 2);
        for r in &backup.partitions {
            assert!(target.contains(&r.hash));
        }
    }

    #[test]
    fn test_import_rejects_tampered_blob() {
        let dir = TempDir::new().unwrap();
        let source = ContentStore::open(dir.path().join("a")).unwrap();
        let backup = setup_backup(&source);

        let mut builder = Builder::new(Vec::new());
        let record = serde_json::to_vec(&backup).unwrap();
        let mut header = Header::new_gnu();
        header.set_size(record.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, RECORD_ENTRY, record.as_slice()).unwrap();
        let hash = backup.partitions[0].hash;
        let mut header = Header::new_gnu();
        header.set_size(5);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}{}", BLOB_PREFIX, hash), &b"evil!"[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let target = ContentStore::open(dir.path().join("b")).unwrap();
        let err = read_archive(bytes.as_slice(), &target).unwrap_err();
        assert_eq!(err.code(), super::super::BackupErrorCode::RvBackupArchive);
        assert!(target.list().unwrap().is_empty());
    }

    #[test]
    fn test_import_without_record_fails_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut builder = Builder::new(Vec::new());
        let data = b"orphan";
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}{}", BLOB_PREFIX, BlobHash::of(data)), &data[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let store = ContentStore::open(dir.path().join("b")).unwrap();
        assert!(read_archive(bytes.as_slice(), &store).is_err());
        assert!(store.list().unwrap().is_empty());
    }
}
