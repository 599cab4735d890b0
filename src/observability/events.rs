//! Typed lifecycle events
//!
//! Every line the crate logs through `log_event` carries one of these
//! names. Ad-hoc strings are reserved for `ObservationScope` prefixes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Configuration and catalog
    ConfigLoaded,
    CatalogLoaded,
    CatalogPersisted,

    // Content store
    BlobStored,
    BlobDeduplicated,
    BlobRemoved,
    /// Stored bytes no longer hash to their name
    BlobCorrupt,
    BlobGarbageCollected,
    BlobDownloaded,
    RetryAttemptFailed,
    RetryExhausted,

    // Backup
    BackupStart,
    BackupComplete,
    BackupFailed,
    BackupDeleted,
    BackupUploaded,
    BackupImported,
    BackupExported,

    // Restore protocol
    RestoreStart,
    QuiesceBegin,
    QuiesceComplete,
    /// Expected race during the drain, swallowed
    QuiesceTransientAbsorbed,
    QuiesceDrainFailed,
    SwapBegin,
    SwapComplete,
    ResumeBegin,
    ResumeComplete,
    RestoreComplete,
    RestoreAborted,
    /// Failure after the swap started; on-disk data is mixed
    RestoreInconsistent,

    // Host
    SaveSuppressed,
    RegionTailTruncated,
    RegionCompacted,
    WorkerStarted,
    WorkerStopped,
    WorkerWriteFailed,

    // Scheduler
    SchedulerStarted,
    SchedulerSkipped,
    SchedulerStopped,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::CatalogLoaded => "CATALOG_LOADED",
            Event::CatalogPersisted => "CATALOG_PERSISTED",

            Event::BlobStored => "BLOB_STORED",
            Event::BlobDeduplicated => "BLOB_DEDUPLICATED",
            Event::BlobRemoved => "BLOB_REMOVED",
            Event::BlobCorrupt => "BLOB_CORRUPT",
            Event::BlobGarbageCollected => "BLOB_GC",
            Event::BlobDownloaded => "BLOB_DOWNLOADED",
            Event::RetryAttemptFailed => "RETRY_ATTEMPT_FAILED",
            Event::RetryExhausted => "RETRY_EXHAUSTED",

            Event::BackupStart => "BACKUP_BEGIN",
            Event::BackupComplete => "BACKUP_COMPLETE",
            Event::BackupFailed => "BACKUP_FAILED",
            Event::BackupDeleted => "BACKUP_DELETED",
            Event::BackupUploaded => "BACKUP_UPLOADED",
            Event::BackupImported => "BACKUP_IMPORTED",
            Event::BackupExported => "BACKUP_EXPORTED",

            Event::RestoreStart => "RESTORE_BEGIN",
            Event::QuiesceBegin => "RESTORE_QUIESCE_BEGIN",
            Event::QuiesceComplete => "RESTORE_QUIESCE_COMPLETE",
            Event::QuiesceTransientAbsorbed => "QUIESCE_TRANSIENT_ABSORBED",
            Event::QuiesceDrainFailed => "QUIESCE_DRAIN_FAILED",
            Event::SwapBegin => "RESTORE_SWAP_BEGIN",
            Event::SwapComplete => "RESTORE_SWAP_COMPLETE",
            Event::ResumeBegin => "RESTORE_RESUME_BEGIN",
            Event::ResumeComplete => "RESTORE_RESUME_COMPLETE",
            Event::RestoreComplete => "RESTORE_COMPLETE",
            Event::RestoreAborted => "RESTORE_FAILED",
            Event::RestoreInconsistent => "RESTORE_INCONSISTENT",

            Event::SaveSuppressed => "SAVE_SUPPRESSED",
            Event::RegionTailTruncated => "REGION_TAIL_TRUNCATED",
            Event::RegionCompacted => "REGION_COMPACTED",
            Event::WorkerStarted => "WORKER_STARTED",
            Event::WorkerStopped => "WORKER_STOPPED",
            Event::WorkerWriteFailed => "WORKER_WRITE_FAILED",

            Event::SchedulerStarted => "SCHEDULER_STARTED",
            Event::SchedulerSkipped => "SCHEDULER_SKIPPED",
            Event::SchedulerStopped => "SCHEDULER_STOPPED",
        }
    }

    /// Severity the event is logged at by `log_event`.
    pub fn severity(&self) -> super::Severity {
        use super::Severity;
        match self {
            Event::RestoreInconsistent => Severity::Fatal,
            Event::BackupFailed
            | Event::RestoreAborted
            | Event::BlobCorrupt
            | Event::QuiesceDrainFailed
            | Event::WorkerWriteFailed
            | Event::RetryExhausted => Severity::Error,
            Event::QuiesceTransientAbsorbed
            | Event::SchedulerSkipped
            | Event::RetryAttemptFailed
            | Event::RegionTailTruncated => Severity::Warn,
            Event::BlobDeduplicated | Event::SaveSuppressed | Event::WorkerStarted | Event::WorkerStopped => {
                Severity::Trace
            }
            _ => Severity::Info,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::RestoreInconsistent)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Severity;

    #[test]
    fn test_event_names_are_upper_snake() {
        let events = [
            Event::ConfigLoaded,
            Event::BlobStored,
            Event::BlobCorrupt,
            Event::BackupStart,
            Event::QuiesceTransientAbsorbed,
            Event::SwapBegin,
            Event::RestoreInconsistent,
            Event::SaveSuppressed,
            Event::SchedulerSkipped,
        ];
        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_only_inconsistent_restore_is_fatal() {
        assert!(Event::RestoreInconsistent.is_fatal());
        assert!(!Event::RestoreAborted.is_fatal());
        assert_eq!(Event::RestoreAborted.severity(), Severity::Error);
        assert_eq!(Event::QuiesceTransientAbsorbed.severity(), Severity::Warn);
    }

    #[test]
    fn test_display_matches_as_str() {
        assert_eq!(format!("{}", Event::SwapComplete), "RESTORE_SWAP_COMPLETE");
    }
}
