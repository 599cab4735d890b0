//! Operational counters
//!
//! Counters are monotonic for the life of the process and use relaxed
//! atomics. A registry is shared by `Arc` between the backup service, the
//! restore coordinator and the workers it drives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    backups_created: AtomicU64,
    backups_failed: AtomicU64,
    backups_deleted: AtomicU64,
    restores_completed: AtomicU64,
    restores_aborted: AtomicU64,
    restores_inconsistent: AtomicU64,
    blobs_written: AtomicU64,
    blobs_deduplicated: AtomicU64,
    blob_bytes_written: AtomicU64,
    transient_errors_absorbed: AtomicU64,
    saves_suppressed: AtomicU64,
    writes_drained: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_backups(&self) {
        self.backups_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_backup_failures(&self) {
        self.backups_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_deletions(&self) {
        self.backups_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_restores(&self) {
        self.restores_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_restore_aborts(&self) {
        self.restores_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_restore_inconsistent(&self) {
        self.restores_inconsistent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a blob put; `created` is false when the content was
    /// already present.
    pub fn record_blob_put(&self, bytes: u64, created: bool) {
        if created {
            self.blobs_written.fetch_add(1, Ordering::Relaxed);
            self.blob_bytes_written.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.blobs_deduplicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_transient_absorbed(&self, count: u64) {
        self.transient_errors_absorbed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_saves_suppressed(&self) {
        self.saves_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_writes_drained(&self, count: u64) {
        self.writes_drained.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backups_created: self.backups_created.load(Ordering::Relaxed),
            backups_failed: self.backups_failed.load(Ordering::Relaxed),
            backups_deleted: self.backups_deleted.load(Ordering::Relaxed),
            restores_completed: self.restores_completed.load(Ordering::Relaxed),
            restores_aborted: self.restores_aborted.load(Ordering::Relaxed),
            restores_inconsistent: self.restores_inconsistent.load(Ordering::Relaxed),
            blobs_written: self.blobs_written.load(Ordering::Relaxed),
            blobs_deduplicated: self.blobs_deduplicated.load(Ordering::Relaxed),
            blob_bytes_written: self.blob_bytes_written.load(Ordering::Relaxed),
            transient_errors_absorbed: self.transient_errors_absorbed.load(Ordering::Relaxed),
            saves_suppressed: self.saves_suppressed.load(Ordering::Relaxed),
            writes_drained: self.writes_drained.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub backups_created: u64,
    pub backups_failed: u64,
    pub backups_deleted: u64,
    pub restores_completed: u64,
    pub restores_aborted: u64,
    pub restores_inconsistent: u64,
    pub blobs_written: u64,
    pub blobs_deduplicated: u64,
    pub blob_bytes_written: u64,
    pub transient_errors_absorbed: u64,
    pub saves_suppressed: u64,
    pub writes_drained: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_registry_is_zero() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.backups_created, 0);
        assert_eq!(snapshot.blobs_written, 0);
        assert_eq!(snapshot.transient_errors_absorbed, 0);
    }

    #[test]
    fn test_blob_put_split_by_created() {
        let registry = MetricsRegistry::new();
        registry.record_blob_put(100, true);
        registry.record_blob_put(100, false);
        registry.record_blob_put(20, true);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.blobs_written, 2);
        assert_eq!(snapshot.blobs_deduplicated, 1);
        assert_eq!(snapshot.blob_bytes_written, 120);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.increment_restores();
        registry.add_transient_absorbed(3);

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["restores_completed"], 1);
        assert_eq!(parsed["transient_errors_absorbed"], 3);
    }

    #[test]
    fn test_concurrent_increments() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..50 {
                        reg.increment_saves_suppressed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.snapshot().saves_suppressed, 400);
    }
}
