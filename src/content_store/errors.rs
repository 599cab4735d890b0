//! Content store errors

use std::io;

use thiserror::Error;

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob {hash} failed integrity check: stored content hashes to {actual}")]
    Integrity { hash: String, actual: String },

    #[error("Blob {hash} could not be decompressed: {reason}")]
    Undecodable { hash: String, reason: String },

    #[error("Invalid blob hash: {0}")]
    InvalidHash(String),

    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BlobError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        BlobError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }

    /// I/O failures may clear up on a later attempt; the rest will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Io { .. })
    }
}
