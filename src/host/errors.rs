//! Host model errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backup::BackupError;
use crate::partition::ChunkPos;
use crate::worker::WorkerError;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Unknown world: {0}")]
    UnknownWorld(String),

    #[error("World already exists: {0}")]
    WorldExists(String),

    /// The component is quiesced; nothing was read or written.
    #[error("{0} is restoring")]
    Restoring(String),

    #[error("Malformed chunk {pos}: {reason}")]
    MalformedChunk { pos: ChunkPos, reason: String },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl HostError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        HostError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the failure only reflects an in-progress restore.
    pub fn is_restoring(&self) -> bool {
        matches!(self, HostError::Restoring(_) | HostError::Worker(WorkerError::Unavailable))
    }
}

impl From<HostError> for BackupError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Io { path, source } => BackupError::io_error_at_path(&path, source),
            HostError::UnknownWorld(world) => BackupError::not_found(format!("world {}", world)),
            other => BackupError::failed(other.to_string()),
        }
    }
}
