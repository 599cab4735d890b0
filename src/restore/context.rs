//! Per-restore state handed to every component

use std::cell::Cell;
use std::fmt;
use std::time::Duration;

/// Coordinator state machine.
///
/// ```text
/// Idle -> Quiescing -> Swapping -> Resuming -> Idle
///            |             |           |
///            v             v           v
///          Failed     Inconsistent  Inconsistent
///            |
///            v
///          Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    Quiescing,
    Swapping,
    Resuming,
    Failed,
    /// Sticky until a later restore succeeds or an operator forces resume
    Inconsistent,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Idle => "idle",
            RestorePhase::Quiescing => "quiescing",
            RestorePhase::Swapping => "swapping",
            RestorePhase::Resuming => "resuming",
            RestorePhase::Failed => "failed",
            RestorePhase::Inconsistent => "inconsistent",
        }
    }

    /// True once any live file may have been replaced.
    pub fn swap_started(&self) -> bool {
        matches!(
            self,
            RestorePhase::Swapping | RestorePhase::Resuming | RestorePhase::Inconsistent
        )
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit restore state threaded through `pre_restore`/`post_restore`.
///
/// Lives on the coordinator's stack for one restore; components read it
/// instead of consulting any process-wide flag.
#[derive(Debug)]
pub struct RestoreContext {
    backup_id: u64,
    drain_timeout: Duration,
    phase: Cell<RestorePhase>,
    absorbed: Cell<u64>,
    drained: Cell<u64>,
    visited: Cell<usize>,
}

impl RestoreContext {
    pub fn new(backup_id: u64, drain_timeout: Duration) -> Self {
        Self {
            backup_id,
            drain_timeout,
            phase: Cell::new(RestorePhase::Idle),
            absorbed: Cell::new(0),
            drained: Cell::new(0),
            visited: Cell::new(0),
        }
    }

    pub fn backup_id(&self) -> u64 {
        self.backup_id
    }

    /// Upper bound on how long one worker's drain may take.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn phase(&self) -> RestorePhase {
        self.phase.get()
    }

    pub(crate) fn set_phase(&self, phase: RestorePhase) {
        self.phase.set(phase);
    }

    /// True inside the restore window (quiesce through resume).
    pub fn is_restoring(&self) -> bool {
        matches!(
            self.phase(),
            RestorePhase::Quiescing | RestorePhase::Swapping | RestorePhase::Resuming
        )
    }

    pub fn record_absorbed(&self, count: u64) {
        self.absorbed.set(self.absorbed.get() + count);
    }

    pub fn record_drained(&self, count: u64) {
        self.drained.set(self.drained.get() + count);
    }

    pub(crate) fn record_visit(&self) {
        self.visited.set(self.visited.get() + 1);
    }

    pub fn absorbed(&self) -> u64 {
        self.absorbed.get()
    }

    pub fn drained(&self) -> u64 {
        self.drained.get()
    }

    pub fn visited(&self) -> usize {
        self.visited.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restoring_window() {
        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        assert!(!ctx.is_restoring());
        ctx.set_phase(RestorePhase::Quiescing);
        assert!(ctx.is_restoring());
        ctx.set_phase(RestorePhase::Failed);
        assert!(!ctx.is_restoring());
    }

    #[test]
    fn test_swap_started() {
        assert!(!RestorePhase::Quiescing.swap_started());
        assert!(RestorePhase::Swapping.swap_started());
        assert!(RestorePhase::Inconsistent.swap_started());
    }

    #[test]
    fn test_counters_accumulate() {
        let ctx = RestoreContext::new(1, Duration::from_secs(1));
        ctx.record_absorbed(2);
        ctx.record_absorbed(1);
        ctx.record_drained(5);
        assert_eq!(ctx.absorbed(), 3);
        assert_eq!(ctx.drained(), 5);
    }
}
