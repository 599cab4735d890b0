//! Restore coordinator
//!
//! Drives one restore through quiesce, swap and resume over a component
//! tree rooted at the server. Only one restore runs at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::catalog::Backup;
use crate::content_store::ContentStore;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, ObservationScope};
use crate::partition::{DatasetLayout, RestoreScope};
use crate::retry::RetryPolicy;

use super::component::{component_id, Restorable};
use super::context::{RestoreContext, RestorePhase};
use super::errors::{RestoreError, RestoreResult};
use super::swap::{self, SwapReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_id: u64,
    /// Distinct components quiesced and resumed
    pub components: usize,
    pub writes_drained: u64,
    pub transient_absorbed: u64,
    pub swap: SwapReport,
}

pub struct RestoreCoordinator {
    layout: DatasetLayout,
    drain_timeout: Duration,
    phase: Mutex<RestorePhase>,
    metrics: Arc<MetricsRegistry>,
    /// Worlds a restore never touches
    preserved_worlds: Vec<String>,
    /// Applied to each blob read while staging
    retry: RetryPolicy,
}

impl RestoreCoordinator {
    pub fn new(layout: DatasetLayout, drain_timeout: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            layout,
            drain_timeout,
            phase: Mutex::new(RestorePhase::Idle),
            metrics,
            preserved_worlds: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_preserved_worlds(mut self, worlds: Vec<String>) -> Self {
        self.preserved_worlds = worlds;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    fn lock_phase(&self) -> MutexGuard<'_, RestorePhase> {
        self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, ctx: &RestoreContext, phase: RestorePhase) {
        *self.lock_phase() = phase;
        ctx.set_phase(phase);
    }

    pub fn phase(&self) -> RestorePhase {
        *self.lock_phase()
    }

    pub fn is_inconsistent(&self) -> bool {
        self.phase() == RestorePhase::Inconsistent
    }

    /// Replaces the live dataset (or the part `scope` names) with
    /// `backup`'s content.
    ///
    /// Errors before the swap leave live data untouched and every
    /// component resumed. Errors after the first file was replaced are
    /// partially applied: the coordinator stays `Inconsistent` and
    /// components stay quiesced until a later restore succeeds or
    /// `force_resume` is called.
    pub fn restore(
        &self,
        root: Arc<dyn Restorable>,
        backup: &Backup,
        store: &ContentStore,
        scope: &RestoreScope,
    ) -> RestoreResult<RestoreReport> {
        let entry_phase = {
            let mut phase = self.lock_phase();
            match *phase {
                RestorePhase::Idle | RestorePhase::Inconsistent => {
                    let entry = *phase;
                    *phase = RestorePhase::Quiescing;
                    entry
                }
                _ => return Err(RestoreError::busy()),
            }
        };

        let backup_id = backup.id.to_string();
        let scope_label = scope_label(scope);
        let obs = ObservationScope::with_fields("RESTORE", &[("backup_id", &backup_id), ("scope", &scope_label)]);

        let ctx = RestoreContext::new(backup.id, self.drain_timeout);
        ctx.set_phase(RestorePhase::Quiescing);

        // Quiesce
        log_event_with_fields(Event::QuiesceBegin, &[("backup_id", &backup_id)]);
        let mut visited: Vec<Arc<dyn Restorable>> = Vec::new();
        let mut seen = HashSet::new();
        if let Err(err) = quiesce(root, &ctx, &mut visited, &mut seen) {
            return Err(self.abort(&ctx, &visited, entry_phase, err, obs));
        }
        log_event_with_fields(
            Event::QuiesceComplete,
            &[
                ("components", &visited.len().to_string()),
                ("drained", &ctx.drained().to_string()),
                ("absorbed", &ctx.absorbed().to_string()),
            ],
        );

        // Swap
        self.set_phase(&ctx, RestorePhase::Swapping);
        log_event_with_fields(Event::SwapBegin, &[("backup_id", &backup_id)]);
        let plan = match swap::stage(
            &self.layout,
            &backup.partitions,
            store,
            scope,
            &self.preserved_worlds,
            &self.retry,
        ) {
            Ok(plan) => plan,
            Err(err) => return Err(self.abort(&ctx, &visited, entry_phase, err, obs)),
        };
        let swap_report = match swap::commit(plan) {
            Ok(report) => report,
            Err(err) if err.is_partially_applied() => return Err(self.inconsistent(&ctx, err, obs)),
            Err(err) => return Err(self.abort(&ctx, &visited, entry_phase, err, obs)),
        };
        log_event_with_fields(
            Event::SwapComplete,
            &[
                ("replaced", &swap_report.replaced.to_string()),
                ("created", &swap_report.created.to_string()),
                ("deleted", &swap_report.deleted.to_string()),
            ],
        );

        // Resume
        self.set_phase(&ctx, RestorePhase::Resuming);
        log_event_with_fields(Event::ResumeBegin, &[("components", &visited.len().to_string())]);
        if let Some(err) = resume_all(&visited, &ctx) {
            return Err(self.inconsistent(&ctx, err.into_partially_applied(), obs));
        }
        log_event_with_fields(Event::ResumeComplete, &[("components", &visited.len().to_string())]);

        self.set_phase(&ctx, RestorePhase::Idle);
        self.metrics.increment_restores();
        self.metrics.add_writes_drained(ctx.drained());
        self.metrics.add_transient_absorbed(ctx.absorbed());

        let report = RestoreReport {
            backup_id: backup.id,
            components: visited.len(),
            writes_drained: ctx.drained(),
            transient_absorbed: ctx.absorbed(),
            swap: swap_report,
        };
        log_event_with_fields(Event::RestoreComplete, &[("backup_id", &backup_id)]);
        obs.complete_with_fields(&[
            ("partitions", &report.swap.partitions.to_string()),
            ("absorbed", &report.transient_absorbed.to_string()),
        ]);
        Ok(report)
    }

    /// Resumes every component under `root` and clears `Inconsistent`.
    ///
    /// For operators who accept the mixed on-disk state.
    pub fn force_resume(&self, root: Arc<dyn Restorable>) -> RestoreResult<usize> {
        {
            let phase = self.lock_phase();
            if !matches!(*phase, RestorePhase::Idle | RestorePhase::Inconsistent) {
                return Err(RestoreError::busy());
            }
        }
        let ctx = RestoreContext::new(0, self.drain_timeout);
        ctx.set_phase(RestorePhase::Resuming);
        let mut nodes = Vec::new();
        collect(root, &mut nodes, &mut HashSet::new());
        if let Some(err) = resume_all(&nodes, &ctx) {
            return Err(err);
        }
        *self.lock_phase() = RestorePhase::Idle;
        Ok(nodes.len())
    }

    fn abort(
        &self,
        ctx: &RestoreContext,
        visited: &[Arc<dyn Restorable>],
        entry_phase: RestorePhase,
        err: RestoreError,
        obs: ObservationScope,
    ) -> RestoreError {
        self.set_phase(ctx, RestorePhase::Failed);
        // failed node included: it may have stopped admission before failing
        if let Some(resume_err) = resume_all(visited, ctx) {
            log_event_with_fields(Event::RestoreAborted, &[("resume_error", &resume_err.to_string())]);
        }
        // an aborted retry does not repair an earlier partial swap
        *self.lock_phase() = entry_phase;
        self.metrics.increment_restore_aborts();
        log_event_with_fields(
            Event::RestoreAborted,
            &[
                ("backup_id", &ctx.backup_id().to_string()),
                ("component", err.component().unwrap_or("-")),
                ("error", &err.to_string()),
            ],
        );
        obs.fail(err.message());
        err
    }

    fn inconsistent(&self, ctx: &RestoreContext, err: RestoreError, obs: ObservationScope) -> RestoreError {
        self.set_phase(ctx, RestorePhase::Inconsistent);
        self.metrics.increment_restore_inconsistent();
        log_event_with_fields(
            Event::RestoreInconsistent,
            &[
                ("backup_id", &ctx.backup_id().to_string()),
                ("component", err.component().unwrap_or("-")),
                ("error", &err.to_string()),
            ],
        );
        obs.fail_fatal(err.message());
        err
    }
}

fn scope_label(scope: &RestoreScope) -> String {
    match scope {
        RestoreScope::Full => "full".to_string(),
        RestoreScope::Area { world, from, to } => format!("{}:{}..{}", world, from, to),
    }
}

/// Parent-first `pre_restore` walk. `visited` receives nodes in
/// post-order (every node after all of its children), which is the
/// resume order: storage reopens before its worker admits writes again.
///
/// A node is recorded even when its own hook or a descendant's fails, so
/// an abort resumes everything that may have stopped admission.
fn quiesce(
    node: Arc<dyn Restorable>,
    ctx: &RestoreContext,
    visited: &mut Vec<Arc<dyn Restorable>>,
    seen: &mut HashSet<usize>,
) -> RestoreResult<()> {
    if !seen.insert(component_id(&node)) {
        return Ok(());
    }
    ctx.record_visit();

    let result = node
        .pre_restore(ctx)
        .map_err(|e| {
            if e.component().is_some() {
                e
            } else {
                e.with_component(node.label())
            }
        })
        .and_then(|()| {
            for child in node.children() {
                quiesce(child, ctx, visited, seen)?;
            }
            Ok(())
        });

    visited.push(node);
    result
}

/// Every node under `root` in post-order.
fn collect(node: Arc<dyn Restorable>, out: &mut Vec<Arc<dyn Restorable>>, seen: &mut HashSet<usize>) {
    if !seen.insert(component_id(&node)) {
        return;
    }
    for child in node.children() {
        collect(child, out, seen);
    }
    out.push(node);
}

/// Runs `post_restore` on every node in the given (children-first)
/// order; returns the first error.
fn resume_all(nodes: &[Arc<dyn Restorable>], ctx: &RestoreContext) -> Option<RestoreError> {
    let mut first = None;
    for node in nodes {
        if let Err(e) = node.post_restore(ctx) {
            let e = if e.component().is_some() { e } else { e.with_component(node.label()) };
            log_event_with_fields(
                Event::RestoreAborted,
                &[("component", &node.label()), ("phase", "resume"), ("error", &e.to_string())],
            );
            first.get_or_insert(e);
        }
    }
    first
}
