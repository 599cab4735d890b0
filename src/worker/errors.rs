//! Persistence worker errors

use thiserror::Error;

use crate::region::RegionError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker is quiesced for a restore (or shutting down) and did
    /// not touch storage.
    #[error("Shard unavailable: restore in progress")]
    Unavailable,

    #[error(transparent)]
    Storage(#[from] RegionError),

    #[error("Drain of {shard} did not finish within {waited_ms} ms")]
    DrainTimeout { shard: String, waited_ms: u128 },

    #[error("Worker thread for {0} is gone")]
    Disconnected(String),

    #[error("Failed to start worker thread: {0}")]
    Spawn(String),
}

impl WorkerError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, WorkerError::Unavailable)
    }
}
