use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::dispatch::UiDispatcher;
use crate::types::HeartbeatListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Slot = Arc<Mutex<Option<(SubscriptionId, Arc<dyn HeartbeatListener>)>>>;

/// Holds the single active listener and delivers events on the UI context.
///
/// The listener is read when the event is delivered, so unsubscribing while
/// a notification is queued drops it.
#[derive(Clone)]
pub struct Notifier {
    slot: Slot,
    next_id: Arc<AtomicU64>,
    ui: UiDispatcher,
}

impl Notifier {
    pub fn new(ui: UiDispatcher) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(0)),
            ui,
        }
    }

    /// Replaces any previous listener.
    pub fn subscribe(&self, listener: Arc<dyn HeartbeatListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some((id, listener));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.slot.lock() {
            Ok(mut slot) if slot.as_ref().map(|(current, _)| *current) == Some(id) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn deliver<F>(&self, f: F)
    where
        F: FnOnce(&dyn HeartbeatListener) + Send + 'static,
    {
        let slot = self.slot.clone();
        self.ui.post(move || {
            let listener = slot
                .lock()
                .ok()
                .and_then(|slot| slot.as_ref().map(|(_, l)| l.clone()));
            if let Some(listener) = listener {
                f(listener.as_ref());
            }
        });
    }

    pub fn started(&self) {
        self.deliver(|l| l.on_started());
    }

    pub fn stopped(&self) {
        self.deliver(|l| l.on_stopped());
    }

    pub fn success(&self, timestamp: i64) {
        self.deliver(move |l| l.on_success(timestamp));
    }

    pub fn failed(&self, message: String) {
        self.deliver(move |l| l.on_failed(&message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl HeartbeatListener for Recorder {
        fn on_started(&self) {
            self.0.lock().unwrap().push("started".into());
        }
        fn on_failed(&self, message: &str) {
            self.0.lock().unwrap().push(format!("failed:{}", message));
        }
    }

    #[test]
    fn events_reach_current_listener_only() {
        let (ui, mut queue) = UiDispatcher::channel();
        let notifier = Notifier::new(ui);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let first_id = notifier.subscribe(first.clone());
        notifier.started();
        queue.run_pending();

        let second_id = notifier.subscribe(second.clone());
        assert!(!notifier.unsubscribe(first_id));
        notifier.failed("boom".into());
        queue.run_pending();

        assert_eq!(*first.0.lock().unwrap(), vec!["started"]);
        assert_eq!(*second.0.lock().unwrap(), vec!["failed:boom"]);

        assert!(notifier.unsubscribe(second_id));
        notifier.started();
        queue.run_pending();
        assert_eq!(second.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_drops_queued_events() {
        let (ui, mut queue) = UiDispatcher::channel();
        let notifier = Notifier::new(ui);
        let rec = Arc::new(Recorder::default());
        let id = notifier.subscribe(rec.clone());
        notifier.started();
        notifier.unsubscribe(id);
        queue.run_pending();
        assert!(rec.0.lock().unwrap().is_empty());
    }
}
