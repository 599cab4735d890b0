//! Scheduled backups
//!
//! The scheduler only decides *when* to back up; these tests check that
//! it takes a backup when one is due, stays quiet otherwise, skips a tick
//! while the service is busy and stops cleanly on shutdown.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use regionvault::backup::scheduler::{run_once, run_scheduled, TickOutcome};
use regionvault::backup::{BackupDatabaseService, BackupResult, LiveDataset, PartitionSource};
use regionvault::config::Config;
use regionvault::host::{ChunkData, Server};
use regionvault::partition::{ChunkPos, PartitionKey};
use tempfile::TempDir;
use tokio::sync::watch;

// =============================================================================
// Test Utilities
// =============================================================================

const HOUR: Duration = Duration::from_secs(3600);

fn setup_service() -> (TempDir, Arc<BackupDatabaseService>, Arc<Server>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Config::for_data_dir(dir.path().join("world"));
    let service = Arc::new(BackupDatabaseService::open(&config).unwrap());
    let server = Arc::new(Server::open(&config, Arc::clone(service.metrics())).unwrap());
    let world = server.add_world("overworld").unwrap();
    world
        .set_chunk(ChunkPos::new(0, 0), ChunkData::new(b"spawn".to_vec()))
        .unwrap();
    (dir, service, server)
}

// =============================================================================
// run_once
// =============================================================================

#[test]
fn test_first_tick_creates_backup_then_not_due() {
    let (_dir, service, server) = setup_service();

    let outcome = run_once(&service, server.as_ref(), HOUR, Utc::now());
    let id = match outcome {
        TickOutcome::Created(id) => id,
        other => panic!("expected a backup, got {:?}", other),
    };
    let backup = service.get_backup(id).unwrap();
    assert!(backup.comment.as_deref().unwrap_or("").starts_with("Scheduled backup"));

    assert_eq!(run_once(&service, server.as_ref(), HOUR, Utc::now()), TickOutcome::NotDue);
    assert_eq!(service.backup_count(), 1);
}

#[test]
fn test_tick_after_interval_creates_another() {
    let (_dir, service, server) = setup_service();
    run_once(&service, server.as_ref(), HOUR, Utc::now());

    let later = Utc::now() + chrono::Duration::hours(2);
    assert!(matches!(
        run_once(&service, server.as_ref(), HOUR, later),
        TickOutcome::Created(_)
    ));
    assert_eq!(service.backup_count(), 2);
}

struct GatedSource {
    entered: mpsc::Sender<()>,
    release: std::sync::Mutex<mpsc::Receiver<()>>,
}

impl PartitionSource for GatedSource {
    fn serialize_partitions(&self) -> BackupResult<Vec<(PartitionKey, Vec<u8>)>> {
        let _ = self.entered.send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(vec![(PartitionKey::new("overworld", ChunkPos::new(0, 0)), b"gated".to_vec())])
    }
}

#[test]
fn test_busy_service_skips_tick() {
    let (_dir, service, server) = setup_service();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let source = GatedSource {
        entered: entered_tx,
        release: std::sync::Mutex::new(release_rx),
    };
    let bg = Arc::clone(&service);
    let handle = thread::spawn(move || bg.create_backup(&source, None).map(|b| b.id));
    entered_rx.recv().unwrap();

    assert_eq!(run_once(&service, server.as_ref(), HOUR, Utc::now()), TickOutcome::SkippedBusy);

    release_tx.send(()).unwrap();
    handle.join().unwrap().unwrap();
    assert_eq!(service.backup_count(), 1);
}

// =============================================================================
// run_scheduled
// =============================================================================

#[tokio::test]
async fn test_scheduled_loop_backs_up_once_per_interval() {
    let (_dir, service, server) = setup_service();
    let (tx, rx) = watch::channel(false);

    let dataset: Arc<dyn LiveDataset> = server;
    let task = tokio::spawn(run_scheduled(
        Arc::clone(&service),
        dataset,
        HOUR,
        Duration::from_millis(10),
        rx,
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    tx.send(true).unwrap();

    let created = task.await.unwrap();
    assert_eq!(created, 1);
    assert_eq!(service.backup_count(), 1);
}

#[tokio::test]
async fn test_scheduled_loop_stops_when_sender_dropped() {
    let (_dir, service, server) = setup_service();
    let (tx, rx) = watch::channel(false);
    drop(tx);

    let created = tokio::time::timeout(
        Duration::from_secs(5),
        run_scheduled(service, server, HOUR, Duration::from_secs(60), rx),
    )
    .await
    .expect("scheduler did not stop");
    assert!(created <= 1);
}
