//! Region storage errors

use std::io;

use thiserror::Error;

pub type RegionResult<T> = Result<T, RegionError>;

/// Errors raised by shard storage.
///
/// `Clone` so one failed write can be reported to every waiter that
/// coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegionError {
    /// The file handle was closed underneath the caller
    #[error("Region handle closed: {0}")]
    Closed(String),

    /// A collection was modified while it was being iterated
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// An iterator or queue was empty when an element was expected
    #[error("Exhausted: {0}")]
    Exhausted(String),

    #[error("Corrupt region file {path} at offset {offset}: {reason}")]
    Corrupt {
        path: String,
        offset: u64,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl RegionError {
    pub fn io(context: impl std::fmt::Display, e: io::Error) -> Self {
        RegionError::Io(format!("{}: {}", context, e))
    }

    /// Races the restore protocol itself provokes while draining: a task
    /// that was already in flight finds its handle closed or its
    /// collection cleared. Anything else is a real failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RegionError::Closed(_) | RegionError::ConcurrentModification(_) | RegionError::Exhausted(_)
        )
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            RegionError::Closed(_) => "closed",
            RegionError::ConcurrentModification(_) => "concurrent_modification",
            RegionError::Exhausted(_) => "exhausted",
            RegionError::Corrupt { .. } => "corrupt",
            RegionError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_set() {
        assert!(RegionError::Closed("r.0.0".into()).is_transient());
        assert!(RegionError::ConcurrentModification("cache".into()).is_transient());
        assert!(RegionError::Exhausted("queue".into()).is_transient());
        assert!(!RegionError::Io("disk".into()).is_transient());
        assert!(!RegionError::Corrupt {
            path: "p".into(),
            offset: 4,
            reason: "crc".into()
        }
        .is_transient());
    }
}
