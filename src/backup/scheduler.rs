//! Periodic backups
//!
//! A tokio task wakes every `tick` and takes a backup when the newest
//! permanent one is older than `interval`. The backup itself runs on the
//! blocking pool. A tick that finds the service busy is skipped, not
//! queued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::observability::{log_event_with_fields, Event};

use super::service::BackupDatabaseService;
use super::{LiveDataset, PartitionSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Created(u64),
    NotDue,
    SkippedBusy,
    Failed(String),
}

/// True when no backup exists or the newest is at least `interval` old.
pub fn is_due(latest: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match latest {
        None => true,
        Some(at) => {
            let age = now.signed_duration_since(at);
            age.to_std().map(|age| age >= interval).unwrap_or(false)
        }
    }
}

/// One scheduler tick, synchronous.
pub fn run_once<S: PartitionSource + ?Sized>(
    service: &BackupDatabaseService,
    source: &S,
    interval: Duration,
    now: DateTime<Utc>,
) -> TickOutcome {
    let latest = service.latest_permanent_backup().map(|b| b.created_at);
    if !is_due(latest, now, interval) {
        return TickOutcome::NotDue;
    }
    if service.is_busy() {
        log_event_with_fields(Event::SchedulerSkipped, &[("reason", "busy")]);
        return TickOutcome::SkippedBusy;
    }
    let comment = format!("Scheduled backup {}", now.format("%Y-%m-%d %H:%M"));
    match service.create_backup(source, Some(comment)) {
        Ok(backup) => TickOutcome::Created(backup.id),
        Err(e) if e.is_busy() => {
            log_event_with_fields(Event::SchedulerSkipped, &[("reason", "busy")]);
            TickOutcome::SkippedBusy
        }
        Err(e) => TickOutcome::Failed(e.to_string()),
    }
}

/// Runs until `shutdown` flips to true or its sender is dropped.
/// Returns the number of backups created.
pub async fn run_scheduled(
    service: Arc<BackupDatabaseService>,
    dataset: Arc<dyn LiveDataset>,
    interval: Duration,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    log_event_with_fields(
        Event::SchedulerStarted,
        &[
            ("interval_secs", &interval.as_secs().to_string()),
            ("tick_ms", &tick.as_millis().to_string()),
        ],
    );

    let mut created = 0;
    let mut timer = tokio::time::interval(tick);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let service = Arc::clone(&service);
                let dataset = Arc::clone(&dataset);
                let outcome = tokio::task::spawn_blocking(move || {
                    run_once(&service, dataset.as_ref(), interval, Utc::now())
                })
                .await;

                match outcome {
                    Ok(TickOutcome::Created(_)) => created += 1,
                    Ok(TickOutcome::Failed(reason)) => {
                        log_event_with_fields(Event::SchedulerSkipped, &[("reason", &reason)]);
                    }
                    Ok(_) => {}
                    Err(join_err) => {
                        log_event_with_fields(Event::SchedulerSkipped, &[("reason", &join_err.to_string())]);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log_event_with_fields(Event::SchedulerStopped, &[("created", &created.to_string())]);
    created
}
