//! Content-addressed blob storage
//!
//! Blobs live at `<root>/<hh>/<remaining hex>` where `hh` is the first
//! byte of the SHA-256 digest. A blob is written once, never modified,
//! and removed only when its reference count drops to zero.
//!
//! # Write path
//!
//! 1. Bytes are written to `<root>/.staging/<uuid>` and fsynced
//! 2. The staged file is renamed to its content address
//! 3. The fan-out directory is fsynced
//!
//! A reader resolving a hash therefore never sees a partial blob.
//!
//! # Compression
//!
//! Payloads larger than `COMPRESS_THRESHOLD` are stored gzipped under
//! `<hh>/<remaining hex>.gz`. The hash always names the uncompressed
//! content, so deduplication and verification do not depend on how a
//! blob happens to be stored.
//!
//! # Reference counting
//!
//! Counts are held in memory and rebuilt from the catalog on open
//! (`rebuild_refs`). The catalog is the durable source of truth; a crash
//! between catalog and blob updates leaves at worst an unreferenced blob,
//! which `sweep_unreferenced` removes.

mod errors;
mod hash;

pub use errors::{BlobError, BlobResult};
pub use hash::BlobHash;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::durability::fsync_dir;
use crate::observability::{log_event_with_fields, Event};

const STAGING_DIR: &str = ".staging";
const COMPRESSED_EXT: &str = "gz";

/// Payloads above this many bytes are gzipped.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub hash: BlobHash,
    /// Uncompressed payload size
    pub size: u64,
    /// Bytes the blob occupies on disk
    pub stored_size: u64,
    pub compressed: bool,
    /// False when identical content was already stored
    pub created: bool,
}

/// Result of an unreferenced-blob sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub bytes_freed: u64,
}

#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    refs: Mutex<HashMap<BlobHash, u64>>,
}

impl ContentStore {
    /// Opens (creating if needed) a store rooted at `root` and discards
    /// leftover staging files from an interrupted write.
    pub fn open(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| BlobError::io(staging.display().to_string(), e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| BlobError::io(staging.display().to_string(), e))?;

        Ok(Self {
            root,
            refs: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plain_path(&self, hash: &BlobHash) -> PathBuf {
        let (dir, file) = hash.split_path();
        self.root.join(dir).join(file)
    }

    fn compressed_path(&self, hash: &BlobHash) -> PathBuf {
        self.plain_path(hash).with_extension(COMPRESSED_EXT)
    }

    /// Location a blob has: the gzipped file if one exists, otherwise the
    /// plain one (which may not exist either).
    pub fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        let compressed = self.compressed_path(hash);
        if compressed.is_file() {
            compressed
        } else {
            self.plain_path(hash)
        }
    }

    pub fn contains(&self, hash: &BlobHash) -> bool {
        self.compressed_path(hash).is_file() || self.plain_path(hash).is_file()
    }

    pub fn is_compressed(&self, hash: &BlobHash) -> bool {
        self.compressed_path(hash).is_file()
    }

    /// Bytes a stored blob occupies on disk.
    pub fn stored_size(&self, hash: &BlobHash) -> BlobResult<u64> {
        let path = self.get(hash)?;
        fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| BlobError::io(path.display().to_string(), e))
    }

    /// Stores `data` under its content hash. Idempotent.
    pub fn put(&self, data: &[u8]) -> BlobResult<PutOutcome> {
        let hash = BlobHash::of(data);
        let size = data.len() as u64;

        if self.contains(&hash) {
            log_event_with_fields(Event::BlobDeduplicated, &[("hash", &hash.to_hex())]);
            return Ok(PutOutcome {
                hash,
                size,
                stored_size: self.stored_size(&hash)?,
                compressed: self.is_compressed(&hash),
                created: false,
            });
        }

        let compressed = data.len() > COMPRESS_THRESHOLD;
        let payload: Cow<'_, [u8]> = if compressed {
            Cow::Owned(gzip(data).map_err(|e| BlobError::io(format!("compressing blob {}", hash), e))?)
        } else {
            Cow::Borrowed(data)
        };
        let target = if compressed {
            self.compressed_path(&hash)
        } else {
            self.plain_path(&hash)
        };

        let staged = self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        let fan_out = target.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());

        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&staged)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            drop(file);
            fs::create_dir_all(&fan_out)?;
            // a concurrent put of the same content renames identical bytes
            fs::rename(&staged, &target)?;
            fsync_dir(&fan_out)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&staged);
            return Err(BlobError::io(format!("storing blob {}", hash), e));
        }

        let stored_size = payload.len() as u64;
        log_event_with_fields(
            Event::BlobStored,
            &[
                ("hash", &hash.to_hex()),
                ("size", &size.to_string()),
                ("stored_size", &stored_size.to_string()),
            ],
        );
        Ok(PutOutcome {
            hash,
            size,
            stored_size,
            compressed,
            created: true,
        })
    }

    /// Resolves a hash to its file. `NotFound` if absent.
    pub fn get(&self, hash: &BlobHash) -> BlobResult<PathBuf> {
        let path = self.blob_path(hash);
        if path.is_file() {
            Ok(path)
        } else {
            Err(BlobError::NotFound(hash.to_hex()))
        }
    }

    /// Reads a blob, decompressing if needed, and verifies it still
    /// hashes to its name.
    pub fn read(&self, hash: &BlobHash) -> BlobResult<Vec<u8>> {
        let data = self.read_content(hash)?;
        let actual = BlobHash::of(&data);
        if actual != *hash {
            return Err(BlobError::Integrity {
                hash: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(data)
    }

    fn read_content(&self, hash: &BlobHash) -> BlobResult<Vec<u8>> {
        let path = self.get(hash)?;
        let mut raw = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|e| BlobError::io(path.display().to_string(), e))?;

        if path.extension().and_then(|e| e.to_str()) != Some(COMPRESSED_EXT) {
            return Ok(raw);
        }
        let mut data = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut data)
            .map_err(|e| BlobError::Undecodable {
                hash: hash.to_hex(),
                reason: e.to_string(),
            })?;
        Ok(data)
    }

    /// True when the stored content still hashes to `hash`. A gzipped
    /// blob that no longer decompresses is corrupt too. Never repairs.
    pub fn check(&self, hash: &BlobHash) -> BlobResult<bool> {
        let ok = match self.read_content(hash) {
            Ok(data) => BlobHash::of(&data) == *hash,
            Err(BlobError::Undecodable { .. }) => false,
            Err(e) => return Err(e),
        };
        if !ok {
            log_event_with_fields(Event::BlobCorrupt, &[("hash", &hash.to_hex())]);
        }
        Ok(ok)
    }

    /// Adds one reference. The blob must exist.
    pub fn retain(&self, hash: &BlobHash) -> BlobResult<u64> {
        if !self.contains(hash) {
            return Err(BlobError::NotFound(hash.to_hex()));
        }
        let mut refs = self.lock_refs();
        let count = refs.entry(*hash).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    /// Drops one reference; the file is removed when none remain.
    /// Returns true if the blob was physically deleted.
    pub fn release(&self, hash: &BlobHash) -> BlobResult<bool> {
        let mut refs = self.lock_refs();
        if let Some(count) = refs.get_mut(hash) {
            if *count > 1 {
                *count -= 1;
                return Ok(false);
            }
            refs.remove(hash);
        }
        // count lock stays held until the file is gone
        self.remove_file(hash)
    }

    /// Removes a blob only if nothing references it.
    pub fn discard_if_unreferenced(&self, hash: &BlobHash) -> BlobResult<bool> {
        let refs = self.lock_refs();
        if refs.get(hash).copied().unwrap_or(0) > 0 {
            return Ok(false);
        }
        self.remove_file(hash)
    }

    fn remove_file(&self, hash: &BlobHash) -> BlobResult<bool> {
        let path = self.blob_path(hash);
        match fs::remove_file(&path) {
            Ok(()) => {
                log_event_with_fields(Event::BlobRemoved, &[("hash", &hash.to_hex())]);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::io(path.display().to_string(), e)),
        }
    }

    pub fn ref_count(&self, hash: &BlobHash) -> u64 {
        self.lock_refs().get(hash).copied().unwrap_or(0)
    }

    /// Replaces all in-memory counts with one reference per item.
    pub fn rebuild_refs<'a, I>(&self, hashes: I)
    where
        I: IntoIterator<Item = &'a BlobHash>,
    {
        let mut refs = self.lock_refs();
        refs.clear();
        for hash in hashes {
            *refs.entry(*hash).or_insert(0) += 1;
        }
    }

    /// Every blob physically present, sorted.
    pub fn list(&self) -> BlobResult<Vec<BlobHash>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| BlobError::io(self.root.display().to_string(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BlobError::io(self.root.display().to_string(), e))?;
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if dir_name.len() != 2 || !entry.path().is_dir() {
                continue;
            }
            let inner = fs::read_dir(entry.path()).map_err(|e| BlobError::io(dir_name.clone(), e))?;
            for file in inner {
                let file = file.map_err(|e| BlobError::io(dir_name.clone(), e))?;
                let file_name = file.file_name().to_string_lossy().into_owned();
                let rest = file_name
                    .strip_suffix(&format!(".{}", COMPRESSED_EXT))
                    .unwrap_or(&file_name);
                let name = format!("{}{}", dir_name, rest);
                if let Ok(hash) = name.parse::<BlobHash>() {
                    out.push(hash);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Bytes used by stored blobs.
    pub fn disk_usage(&self) -> BlobResult<u64> {
        let mut total = 0;
        for hash in self.list()? {
            let path = self.blob_path(&hash);
            total += fs::metadata(&path)
                .map_err(|e| BlobError::io(path.display().to_string(), e))?
                .len();
        }
        Ok(total)
    }

    /// Removes every stored blob with no reference.
    pub fn sweep_unreferenced(&self) -> BlobResult<SweepReport> {
        let mut report = SweepReport::default();
        for hash in self.list()? {
            let size = fs::metadata(self.blob_path(&hash)).map(|m| m.len()).unwrap_or(0);
            if self.discard_if_unreferenced(&hash)? {
                report.removed += 1;
                report.bytes_freed += size;
            }
        }
        log_event_with_fields(
            Event::BlobGarbageCollected,
            &[
                ("removed", &report.removed.to_string()),
                ("bytes_freed", &report.bytes_freed.to_string()),
            ],
        );
        Ok(report)
    }

    fn lock_refs(&self) -> std::sync::MutexGuard<'_, HashMap<BlobHash, u64>> {
        self.refs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_store() -> (TempDir, ContentStore) {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path().join("blob")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = setup_store();
        let first = store.put(b"region data").unwrap();
        let second = store.put(b"region data").unwrap();

        assert_eq!(first.hash, second.hash);
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(store.list().unwrap(), vec![first.hash]);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let (_dir, store) = setup_store();
        let err = store.get(&BlobHash::of(b"never stored")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_blob_lands_in_fan_out_dir() {
        let (_dir, store) = setup_store();
        let out = store.put(b"abc").unwrap();
        let path = store.get(&out.hash).unwrap();
        let (dir, file) = out.hash.split_path();
        assert!(path.ends_with(Path::new(&dir).join(file)));
        assert_eq!(fs::read(path).unwrap(), b"abc");
    }

    #[test]
    fn test_check_detects_corruption() {
        let (_dir, store) = setup_store();
        let out = store.put(b"pristine").unwrap();
        assert!(store.check(&out.hash).unwrap());

        fs::write(store.blob_path(&out.hash), b"tampered").unwrap();
        assert!(!store.check(&out.hash).unwrap());
        assert!(matches!(store.read(&out.hash), Err(BlobError::Integrity { .. })));
    }

    #[test]
    fn test_release_deletes_at_zero() {
        let (_dir, store) = setup_store();
        let out = store.put(b"shared").unwrap();
        store.retain(&out.hash).unwrap();
        store.retain(&out.hash).unwrap();

        assert!(!store.release(&out.hash).unwrap());
        assert!(store.contains(&out.hash));
        assert!(store.release(&out.hash).unwrap());
        assert!(!store.contains(&out.hash));
    }

    #[test]
    fn test_retain_missing_blob_fails() {
        let (_dir, store) = setup_store();
        assert!(store.retain(&BlobHash::of(b"ghost")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_sweep_keeps_referenced() {
        let (_dir, store) = setup_store();
        let kept = store.put(b"kept").unwrap();
        let orphan = store.put(b"orphan").unwrap();
        store.retain(&kept.hash).unwrap();

        let report = store.sweep_unreferenced().unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes_freed, 6);
        assert!(store.contains(&kept.hash));
        assert!(!store.contains(&orphan.hash));
    }

    #[test]
    fn test_rebuild_refs_counts_duplicates() {
        let (_dir, store) = setup_store();
        let a = store.put(b"a").unwrap().hash;
        store.rebuild_refs([&a, &a]);
        assert_eq!(store.ref_count(&a), 2);
    }

    #[test]
    fn test_open_clears_staging() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("blob");
        fs::create_dir_all(root.join(STAGING_DIR)).unwrap();
        fs::write(root.join(STAGING_DIR).join("leftover"), b"partial").unwrap();

        let store = ContentStore::open(&root).unwrap();
        assert!(!root.join(STAGING_DIR).join("leftover").exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_large_blob_is_gzipped() {
        let (_dir, store) = setup_store();
        let data = b"stone ".repeat(400);
        let out = store.put(&data).unwrap();

        assert!(out.compressed);
        assert_eq!(out.size, data.len() as u64);
        assert!(out.stored_size < out.size);
        assert!(store.get(&out.hash).unwrap().to_string_lossy().ends_with(".gz"));
        assert_eq!(store.read(&out.hash).unwrap(), data);
        assert!(store.check(&out.hash).unwrap());
        assert_eq!(store.list().unwrap(), vec![out.hash]);
        assert_eq!(store.disk_usage().unwrap(), out.stored_size);

        let again = store.put(&data).unwrap();
        assert!(!again.created);
        assert!(again.compressed);
        assert_eq!(again.stored_size, out.stored_size);
    }

    #[test]
    fn test_small_blob_stays_plain() {
        let (_dir, store) = setup_store();
        let out = store.put(&[7u8; COMPRESS_THRESHOLD]).unwrap();
        assert!(!out.compressed);
        assert_eq!(out.stored_size, out.size);
        assert!(!store.is_compressed(&out.hash));
    }

    #[test]
    fn test_undecodable_gzip_fails_check() {
        let (_dir, store) = setup_store();
        let out = store.put(&vec![1u8; 4096]).unwrap();
        fs::write(store.blob_path(&out.hash), b"not gzip").unwrap();

        assert!(!store.check(&out.hash).unwrap());
        assert!(matches!(store.read(&out.hash), Err(BlobError::Undecodable { .. })));
    }

    #[test]
    fn test_release_removes_compressed_blob() {
        let (_dir, store) = setup_store();
        let out = store.put(&vec![2u8; 4096]).unwrap();
        store.retain(&out.hash).unwrap();
        assert!(store.release(&out.hash).unwrap());
        assert!(!store.contains(&out.hash));
    }

    #[test]
    fn test_disk_usage() {
        let (_dir, store) = setup_store();
        store.put(b"1234").unwrap();
        store.put(b"56").unwrap();
        store.put(b"1234").unwrap();
        assert_eq!(store.disk_usage().unwrap(), 6);
    }
}
