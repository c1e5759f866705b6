use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A pending timer. Dropping or cancelling it aborts the underlying task;
/// a fire that already reached the channel is recognised as stale by its id.
#[derive(Debug)]
pub struct Timer {
    id: TimerId,
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns timers that deliver their fire as a message on the owner's channel.
pub struct Timers<M> {
    tx: mpsc::UnboundedSender<M>,
    next_id: u64,
}

impl<M: Send + 'static> Timers<M> {
    pub fn new(tx: mpsc::UnboundedSender<M>) -> Self {
        Self { tx, next_id: 0 }
    }

    fn allocate(&mut self) -> TimerId {
        self.next_id += 1;
        TimerId(self.next_id)
    }

    pub fn once<F>(&mut self, delay: Duration, message: F) -> Timer
    where
        F: FnOnce(TimerId) -> M + Send + 'static,
    {
        let id = self.allocate();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(message(id));
        });
        Timer { id, handle }
    }

    /// First fire after `first`, then every `period`.
    pub fn periodic<F>(&mut self, first: Duration, period: Duration, message: F) -> Timer
    where
        F: Fn(TimerId) -> M + Send + 'static,
    {
        let id = self.allocate();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(message(id)).is_err() {
                    break;
                }
            }
        });
        Timer { id, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        let start = Instant::now();
        let timer = timers.once(Duration::from_secs(30), |id| id);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, timer.id());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_keeps_firing_until_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        let start = Instant::now();
        let timer = timers.periodic(Duration::ZERO, Duration::from_secs(60), |id| id);

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));

        timer.cancel();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique() {
        let (tx, _rx) = mpsc::unbounded_channel::<TimerId>();
        let mut timers = Timers::new(tx);
        let a = timers.once(Duration::from_secs(1), |id| id);
        let b = timers.once(Duration::from_secs(1), |id| id);
        assert_ne!(a.id(), b.id());
    }
}
