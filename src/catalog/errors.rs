//! Catalog errors

use std::io;

use thiserror::Error;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("backup #{0} not found")]
    NotFound(u64),

    #[error("catalog is corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported catalog format version {0}")]
    UnsupportedVersion(u32),

    #[error("catalog I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl CatalogError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        CatalogError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }
}
