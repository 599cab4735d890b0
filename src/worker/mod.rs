//! Per-shard persistence worker
//!
//! Each shard has one dedicated thread that applies its write-behind
//! queue serially. Callers enqueue reads and writes and get a
//! `Completion` back.
//!
//! # Ordering
//!
//! - Writes to one shard apply in enqueue order
//! - A write to a partition that already has a pending write replaces
//!   its payload (latest wins) and joins its waiters
//! - Reads of a partition with a pending write are served from the
//!   pending payload
//!
//! # Quiesce
//!
//! `quiesce` flips `restoring` under the state lock, so no request is
//! admitted afterwards, then pushes a `Drain` task to the *front* of the
//! queue and waits for it. The worker thread runs every task still
//! queued: writes apply, reads resolve `Unavailable`. When the reply
//! arrives the queue is empty and stays empty until `resume`. A task
//! the thread had already popped finishes before the `Drain` runs, so
//! the shortcut for an idle, never-opened shard also checks `in_flight`.
//!
//! Storage errors inside the restore window are classified: the
//! transient set (`RegionError::is_transient`) is logged and counted,
//! anything else is reported back so the coordinator can abort.

mod cache;
mod completion;
mod errors;

pub use cache::{CacheStats, ReadCache};
pub use completion::Completion;
pub use errors::{WorkerError, WorkerResult};

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::observability::{log_event_with_fields, Event};
use crate::partition::{ChunkPos, ShardKey};
use crate::region::{RegionError, ShardStorage};
use crate::restore::{ComponentKind, Restorable, RestoreContext, RestoreError, RestoreResult};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub read_cache_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            read_cache_capacity: 256,
        }
    }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub writes_applied: u64,
    pub transient_absorbed: u64,
    /// First non-transient storage error seen in the restore window
    pub failure: Option<RegionError>,
}

type Reply<T> = Sender<WorkerResult<T>>;

enum Task {
    Write(ChunkPos),
    Read { pos: ChunkPos, reply: Reply<Option<Vec<u8>>> },
    Flush(Reply<()>),
    Snapshot(Reply<Vec<(ChunkPos, Vec<u8>)>>),
    Drain(Sender<DrainReport>),
}

struct PendingWrite {
    data: Vec<u8>,
    waiters: Vec<Reply<()>>,
}

struct ShardState {
    tasks: VecDeque<Task>,
    pending: BTreeMap<ChunkPos, PendingWrite>,
    cache: ReadCache,
    restoring: bool,
    shutdown: bool,
    /// A task popped by the worker thread and not yet finished
    in_flight: bool,
    window_absorbed: u64,
    window_failure: Option<RegionError>,
}

struct Shared {
    shard: ShardKey,
    state: Mutex<ShardState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ShardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Write-behind queue in front of one shard's storage.
pub struct PersistenceWorker<S: ShardStorage> {
    shared: Arc<Shared>,
    storage: Arc<S>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ShardStorage> std::fmt::Debug for PersistenceWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWorker")
            .field("shard", &self.shared.shard.to_string())
            .finish_non_exhaustive()
    }
}

impl<S: ShardStorage> PersistenceWorker<S> {
    /// Starts the worker thread for `storage`'s shard.
    pub fn spawn(storage: Arc<S>, config: &WorkerConfig) -> WorkerResult<Arc<Self>> {
        let shard = storage.shard().clone();
        let shared = Arc::new(Shared {
            shard: shard.clone(),
            state: Mutex::new(ShardState {
                tasks: VecDeque::new(),
                pending: BTreeMap::new(),
                cache: ReadCache::new(config.read_cache_capacity),
                restoring: false,
                shutdown: false,
                in_flight: false,
                window_absorbed: 0,
                window_failure: None,
            }),
            wake: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_storage = Arc::clone(&storage);
        let handle = thread::Builder::new()
            .name(format!("shard-io-{}", shard))
            .spawn(move || run(thread_shared, thread_storage))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        log_event_with_fields(Event::WorkerStarted, &[("shard", &shard.to_string())]);

        Ok(Arc::new(Self {
            shared,
            storage,
            thread: Mutex::new(Some(handle)),
        }))
    }

    pub fn shard(&self) -> &ShardKey {
        &self.shared.shard
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    fn notify(&self) {
        self.shared.wake.notify_all();
    }

    fn pending_completion<T>(&self, rx: mpsc::Receiver<WorkerResult<T>>) -> Completion<T> {
        Completion::pending(self.shared.shard.to_string(), rx)
    }

    /// Reads a partition. Pending writes and cached reads resolve
    /// immediately; otherwise the read is queued behind earlier writes.
    pub fn load(&self, pos: ChunkPos) -> Completion<Option<Vec<u8>>> {
        let mut state = self.shared.lock();
        if state.restoring || state.shutdown {
            return Completion::unavailable();
        }
        if let Some(pending) = state.pending.get(&pos) {
            return Completion::ready(Ok(Some(pending.data.clone())));
        }
        if let Some(data) = state.cache.get(&pos) {
            return Completion::ready(Ok(Some(data)));
        }
        let (tx, rx) = mpsc::channel();
        state.tasks.push_back(Task::Read { pos, reply: tx });
        drop(state);
        self.notify();
        self.pending_completion(rx)
    }

    /// Queues a write. Rejected with `Unavailable` while quiesced.
    pub fn store(&self, pos: ChunkPos, data: Vec<u8>) -> Completion<()> {
        let mut guard = self.shared.lock();
        if guard.restoring || guard.shutdown {
            log_event_with_fields(
                Event::SaveSuppressed,
                &[("shard", &self.shared.shard.to_string()), ("chunk", &pos.to_string())],
            );
            return Completion::unavailable();
        }

        let (tx, rx) = mpsc::channel();
        let state = &mut *guard;
        state.cache.remove(&pos);
        match state.pending.entry(pos) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.data = data;
                pending.waiters.push(tx);
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingWrite {
                    data,
                    waiters: vec![tx],
                });
                state.tasks.push_back(Task::Write(pos));
            }
        }
        drop(guard);
        self.notify();
        self.pending_completion(rx)
    }

    /// Waits until every write queued before this call is applied and
    /// storage is synced.
    pub fn flush(&self) -> WorkerResult<()> {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.shared.lock();
            if state.restoring || state.shutdown {
                return Err(WorkerError::Unavailable);
            }
            state.tasks.push_back(Task::Flush(tx));
        }
        self.notify();
        self.pending_completion(rx).wait()
    }

    /// Every stored partition, read after all earlier writes applied.
    pub fn snapshot(&self) -> WorkerResult<Vec<(ChunkPos, Vec<u8>)>> {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.shared.lock();
            if state.restoring || state.shutdown {
                return Err(WorkerError::Unavailable);
            }
            state.tasks.push_back(Task::Snapshot(tx));
        }
        self.notify();
        self.pending_completion(rx).wait()
    }

    /// Stops admission and drains the queue. Returns once queue depth is
    /// zero or `timeout` elapsed.
    pub fn quiesce(&self, timeout: Duration) -> WorkerResult<DrainReport> {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(WorkerError::Disconnected(self.shared.shard.to_string()));
            }
            state.restoring = true;
            if state.tasks.is_empty() && !state.in_flight && !self.storage.is_open() {
                // nothing queued, running or opened
                return Ok(DrainReport::default());
            }
            state.tasks.push_front(Task::Drain(tx));
        }
        self.notify();

        match rx.recv_timeout(timeout) {
            Ok(report) => Ok(report),
            Err(RecvTimeoutError::Timeout) => Err(WorkerError::DrainTimeout {
                shard: self.shared.shard.to_string(),
                waited_ms: timeout.as_millis(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(WorkerError::Disconnected(self.shared.shard.to_string()))
            }
        }
    }

    /// Re-enables admission after a restore.
    pub fn resume(&self) {
        let mut state = self.shared.lock();
        state.restoring = false;
        state.cache.clear();
        state.window_absorbed = 0;
        state.window_failure = None;
    }

    pub fn is_restoring(&self) -> bool {
        self.shared.lock().restoring
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.lock().cache.stats().clone()
    }

    pub fn cached_entries(&self) -> usize {
        self.shared.lock().cache.len()
    }
}

impl<S: ShardStorage> Drop for PersistenceWorker<S> {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.notify();
        let handle = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        log_event_with_fields(Event::WorkerStopped, &[("shard", &self.shared.shard.to_string())]);
    }
}

impl<S: ShardStorage> Restorable for PersistenceWorker<S> {
    fn kind(&self) -> ComponentKind {
        ComponentKind::PersistenceWorker
    }

    fn label(&self) -> String {
        format!("worker:{}", self.shared.shard)
    }

    fn pre_restore(&self, ctx: &RestoreContext) -> RestoreResult<()> {
        let report = self
            .quiesce(ctx.drain_timeout())
            .map_err(|e| RestoreError::aborted(self.shared.shard.to_string(), e.to_string()))?;

        ctx.record_drained(report.writes_applied);
        ctx.record_absorbed(report.transient_absorbed);

        if let Some(failure) = report.failure {
            return Err(RestoreError::aborted(
                self.shared.shard.to_string(),
                format!("write failed during drain: {}", failure),
            ));
        }
        Ok(())
    }

    fn post_restore(&self, _ctx: &RestoreContext) -> RestoreResult<()> {
        self.resume();
        Ok(())
    }

    fn children(&self) -> Vec<Arc<dyn Restorable>> {
        vec![Arc::clone(&self.storage) as Arc<dyn Restorable>]
    }
}

fn run<S: ShardStorage>(shared: Arc<Shared>, storage: Arc<S>) {
    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    state.in_flight = true;
                    break Some(task);
                }
                if state.shutdown {
                    break None;
                }
                state = shared.wake.wait(state).unwrap_or_else(|p| p.into_inner());
            }
        };

        match task {
            Some(Task::Drain(reply)) => {
                let report = drain(&shared, storage.as_ref());
                let _ = reply.send(report);
            }
            Some(task) => {
                execute(&shared, storage.as_ref(), task);
            }
            None => break,
        }
        shared.lock().in_flight = false;
    }
}

/// Runs everything still queued. Admission is closed, so the queue only
/// shrinks.
fn drain<S: ShardStorage>(shared: &Shared, storage: &S) -> DrainReport {
    let budget = shared.lock().tasks.len();
    let mut writes_applied = 0;

    for _ in 0..budget {
        let task = shared.lock().tasks.pop_front();
        match task {
            Some(Task::Drain(reply)) => {
                let _ = reply.send(DrainReport::default());
            }
            Some(task) => {
                if execute(shared, storage, task) {
                    writes_applied += 1;
                }
            }
            None => break,
        }
    }

    let mut state = shared.lock();
    debug_assert!(state.tasks.is_empty() || !state.restoring);
    state.cache.clear();
    DrainReport {
        writes_applied,
        transient_absorbed: std::mem::take(&mut state.window_absorbed),
        failure: state.window_failure.take(),
    }
}

/// Executes one task; returns true when a write reached storage.
fn execute<S: ShardStorage>(shared: &Shared, storage: &S, task: Task) -> bool {
    match task {
        Task::Write(pos) => {
            let pending = shared.lock().pending.remove(&pos);
            let Some(PendingWrite { data, waiters }) = pending else {
                return false;
            };
            let result = storage.write(pos, &data);
            if let Err(ref e) = result {
                classify_failure(shared, pos, e);
            }
            for waiter in waiters {
                let _ = waiter.send(result.clone().map_err(WorkerError::from));
            }
            result.is_ok()
        }
        Task::Read { pos, reply } => {
            if shared.lock().restoring {
                let _ = reply.send(Err(WorkerError::Unavailable));
                return false;
            }
            let result = storage.read(pos);
            if let Ok(Some(ref data)) = result {
                let mut state = shared.lock();
                // a write queued meanwhile supersedes what was read
                if !state.pending.contains_key(&pos) && !state.restoring {
                    state.cache.insert(pos, data.clone());
                }
            }
            let _ = reply.send(result.map_err(WorkerError::from));
            false
        }
        Task::Flush(reply) => {
            let result = if shared.lock().restoring {
                Err(WorkerError::Unavailable)
            } else {
                storage.sync().map_err(WorkerError::from)
            };
            let _ = reply.send(result);
            false
        }
        Task::Snapshot(reply) => {
            let result = if shared.lock().restoring {
                Err(WorkerError::Unavailable)
            } else {
                storage.entries().map_err(WorkerError::from)
            };
            let _ = reply.send(result);
            false
        }
        Task::Drain(reply) => {
            let _ = reply.send(DrainReport::default());
            false
        }
    }
}

fn classify_failure(shared: &Shared, pos: ChunkPos, error: &RegionError) {
    let mut state = shared.lock();
    let shard = shared.shard.to_string();
    let chunk = pos.to_string();
    if !state.restoring {
        log_event_with_fields(
            Event::WorkerWriteFailed,
            &[("shard", &shard), ("chunk", &chunk), ("error", &error.to_string())],
        );
        return;
    }
    if error.is_transient() {
        state.window_absorbed += 1;
        log_event_with_fields(
            Event::QuiesceTransientAbsorbed,
            &[("shard", &shard), ("chunk", &chunk), ("kind", error.kind_str())],
        );
    } else {
        log_event_with_fields(
            Event::QuiesceDrainFailed,
            &[("shard", &shard), ("chunk", &chunk), ("error", &error.to_string())],
        );
        if state.window_failure.is_none() {
            state.window_failure = Some(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::RegionPos;
    use crate::region::RegionStorage;
    use tempfile::TempDir;

    fn setup_worker() -> (TempDir, Arc<PersistenceWorker<RegionStorage>>) {
        let dir = TempDir::new().unwrap();
        let shard = ShardKey::new("overworld", RegionPos::new(0, 0));
        let storage = RegionStorage::new(shard, dir.path().join("r.0.0.rgn"));
        let worker = PersistenceWorker::spawn(storage, &WorkerConfig::default()).unwrap();
        (dir, worker)
    }

    fn ctx() -> RestoreContext {
        RestoreContext::new(1, Duration::from_secs(5))
    }

    #[test]
    fn test_store_then_load() {
        let (_dir, worker) = setup_worker();
        worker.store(ChunkPos::new(1, 1), b"hello".to_vec()).wait().unwrap();
        assert_eq!(worker.load(ChunkPos::new(1, 1)).wait().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(worker.load(ChunkPos::new(2, 2)).wait().unwrap(), None);
    }

    #[test]
    fn test_repeated_store_coalesces_latest_wins() {
        let (_dir, worker) = setup_worker();
        let pos = ChunkPos::new(0, 0);
        let a = worker.store(pos, b"v1".to_vec());
        let b = worker.store(pos, b"v2".to_vec());
        a.wait().unwrap();
        b.wait().unwrap();
        worker.flush().unwrap();
        assert_eq!(worker.load(pos).wait().unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_quiesce_empties_queue_and_rejects() {
        let (_dir, worker) = setup_worker();
        for i in 0..20 {
            let _ = worker.store(ChunkPos::new(i, 0), vec![i as u8]);
        }

        worker.pre_restore(&ctx()).unwrap();
        assert_eq!(worker.queue_depth(), 0);
        assert_eq!(worker.pending_writes(), 0);
        assert!(worker.is_restoring());

        assert!(worker.store(ChunkPos::new(0, 0), b"late".to_vec()).is_unavailable());
        assert!(worker.load(ChunkPos::new(0, 0)).is_unavailable());
        assert_eq!(worker.flush(), Err(WorkerError::Unavailable));

        worker.post_restore(&ctx()).unwrap();
        assert!(!worker.is_restoring());
        for i in 0..20 {
            assert_eq!(
                worker.load(ChunkPos::new(i, 0)).wait().unwrap(),
                Some(vec![i as u8])
            );
        }
    }

    #[test]
    fn test_quiesce_of_untouched_worker_is_noop() {
        let (dir, worker) = setup_worker();
        let report = worker.quiesce(Duration::from_secs(1)).unwrap();
        assert_eq!(report, DrainReport::default());
        worker.resume();
        assert!(!dir.path().join("r.0.0.rgn").exists());
    }

    #[test]
    fn test_resume_clears_cache() {
        let (_dir, worker) = setup_worker();
        let pos = ChunkPos::new(3, 3);
        worker.store(pos, b"x".to_vec()).wait().unwrap();
        worker.load(pos).wait().unwrap();
        worker.flush().unwrap();
        assert_eq!(worker.cached_entries(), 1);

        worker.pre_restore(&ctx()).unwrap();
        assert_eq!(worker.cached_entries(), 0);
        worker.post_restore(&ctx()).unwrap();
        assert_eq!(worker.cached_entries(), 0);
    }

    #[test]
    fn test_snapshot_sees_prior_writes() {
        let (_dir, worker) = setup_worker();
        let _ = worker.store(ChunkPos::new(0, 1), b"a".to_vec());
        let _ = worker.store(ChunkPos::new(0, 2), b"b".to_vec());
        let entries = worker.snapshot().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_children_is_storage() {
        let (_dir, worker) = setup_worker();
        let children = worker.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind(), ComponentKind::Storage);
    }
}
