//! Serial job queue standing in for the host's UI-affine execution context.
//!
//! Camera surfaces may only be touched from that context, so the cycle worker
//! posts capture jobs here and waits on a oneshot reply with a timeout.
//! Listener notifications are posted here fire-and-forget.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("ui context is gone")]
    Closed,
}

#[derive(Clone)]
pub struct UiDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

/// Receiving end; the host pumps it from its UI loop, or [`UiDispatcher::spawn`]
/// drives it on a dedicated task.
pub struct UiQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl UiDispatcher {
    pub fn channel() -> (Self, UiQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UiQueue { rx })
    }

    /// Runs the queue on its own tokio task. Must be called inside a runtime.
    pub fn spawn() -> Self {
        let (dispatcher, queue) = Self::channel();
        tokio::spawn(queue.run());
        dispatcher
    }

    /// Fire-and-forget. Returns false when the queue is gone.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(f)).is_ok()
    }

    /// Runs `f` on the UI context and waits at most `timeout` for its result.
    pub async fn call<F, T>(&self, f: F, timeout: Duration) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let posted = self.post(move || {
            let _ = reply_tx.send(f());
        });
        if !posted {
            return Err(DispatchError::Closed);
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DispatchError::Closed),
            Err(_) => Err(DispatchError::Timeout(timeout)),
        }
    }
}

impl UiQueue {
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            run_job(job);
        }
    }

    /// Drains whatever is queued right now without waiting.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("UI job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn call_returns_value_from_ui_context() {
        let ui = UiDispatcher::spawn();
        let v = ui.call(|| 21 * 2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_when_queue_is_not_pumped() {
        let (ui, _queue) = UiDispatcher::channel();
        let err = ui.call(|| 1, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, DispatchError::Timeout(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn call_fails_when_queue_is_dropped() {
        let (ui, queue) = UiDispatcher::channel();
        drop(queue);
        assert_eq!(ui.call(|| 1, Duration::from_secs(1)).await, Err(DispatchError::Closed));
    }

    #[test]
    fn run_pending_survives_panicking_jobs() {
        let (ui, mut queue) = UiDispatcher::channel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ui.post(|| panic!("boom"));
        ui.post(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
