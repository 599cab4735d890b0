//! fsync and atomic file replacement helpers

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// fsync a directory so renames inside it are durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    let d = OpenOptions::new().read(true).open(dir)?;
    d.sync_all()
}

/// Sibling path used to stage a replacement of `target`.
pub fn staging_path(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.{}", name, tag, Uuid::new_v4().simple()))
}

/// Writes `bytes` to `target` through a staged sibling file.
///
/// Readers see either the old content or the new content, never a mix.
/// The staged file is removed if any step fails.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    fs::create_dir_all(parent)?;

    let staged = staging_path(target, "tmp");
    let result = (|| {
        let mut file = File::create(&staged)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staged, target)?;
        fsync_dir(parent)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&staged);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("catalog.json");

        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"two");
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_write_atomic_creates_parent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a").join("b").join("f");
        write_atomic(&target, b"x").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"x");
    }

    #[test]
    fn test_staging_path_is_hidden_sibling() {
        let staged = staging_path(Path::new("/data/w/region/r.0.0.rgn"), "restore");
        assert_eq!(staged.parent(), Some(Path::new("/data/w/region")));
        let name = staged.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".r.0.0.rgn.restore."));
    }
}
