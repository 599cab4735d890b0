//! Result handle for a queued read or write

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use super::errors::{WorkerError, WorkerResult};

/// Resolves once the worker thread has run the task.
///
/// Requests made while the worker is quiesced come back already resolved
/// to `WorkerError::Unavailable`; they never wait and never reach
/// storage.
#[derive(Debug)]
pub struct Completion<T> {
    state: State<T>,
}

#[derive(Debug)]
enum State<T> {
    Ready(WorkerResult<T>),
    Pending { shard: String, rx: Receiver<WorkerResult<T>> },
}

impl<T> Completion<T> {
    pub(crate) fn ready(result: WorkerResult<T>) -> Self {
        Self {
            state: State::Ready(result),
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self::ready(Err(WorkerError::Unavailable))
    }

    pub(crate) fn pending(shard: String, rx: Receiver<WorkerResult<T>>) -> Self {
        Self {
            state: State::Pending { shard, rx },
        }
    }

    /// True when the request was rejected up front.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.state, State::Ready(Err(WorkerError::Unavailable)))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    pub fn wait(self) -> WorkerResult<T> {
        match self.state {
            State::Ready(result) => result,
            State::Pending { shard, rx } => rx
                .recv()
                .unwrap_or(Err(WorkerError::Disconnected(shard))),
        }
    }

    pub fn wait_timeout(self, timeout: Duration) -> WorkerResult<T> {
        match self.state {
            State::Ready(result) => result,
            State::Pending { shard, rx } => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(WorkerError::DrainTimeout {
                    shard,
                    waited_ms: timeout.as_millis(),
                }),
                Err(RecvTimeoutError::Disconnected) => Err(WorkerError::Disconnected(shard)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_unavailable_is_ready() {
        let c: Completion<()> = Completion::unavailable();
        assert!(c.is_ready());
        assert!(c.is_unavailable());
        assert_eq!(c.wait(), Err(WorkerError::Unavailable));
    }

    #[test]
    fn test_pending_resolves_from_channel() {
        let (tx, rx) = mpsc::channel();
        let c = Completion::pending("w/r.0.0".into(), rx);
        assert!(!c.is_ready());
        tx.send(Ok(5u32)).unwrap();
        assert_eq!(c.wait(), Ok(5));
    }

    #[test]
    fn test_dropped_sender_is_disconnected() {
        let (tx, rx) = mpsc::channel::<WorkerResult<()>>();
        drop(tx);
        let c = Completion::pending("w/r.0.0".into(), rx);
        assert!(matches!(c.wait(), Err(WorkerError::Disconnected(_))));
    }

    #[test]
    fn test_wait_timeout() {
        let (_tx, rx) = mpsc::channel::<WorkerResult<()>>();
        let c = Completion::pending("w/r.0.0".into(), rx);
        assert!(matches!(
            c.wait_timeout(Duration::from_millis(10)),
            Err(WorkerError::DrainTimeout { .. })
        ));
    }
}
