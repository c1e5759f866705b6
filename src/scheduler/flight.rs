use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Allows at most one cycle in flight. Holding a [`FlightPermit`] is being
/// in flight; dropping it releases the guard unless it was force-cleared
/// and re-acquired in the meantime.
#[derive(Clone, Default)]
pub struct SingleFlight {
    current: Arc<AtomicU64>,
    next: Arc<AtomicU64>,
}

pub struct FlightPermit {
    current: Arc<AtomicU64>,
    id: u64,
}

impl SingleFlight {
    pub fn try_acquire(&self) -> Option<FlightPermit> {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.current
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit {
                current: self.current.clone(),
                id,
            })
    }

    pub fn is_busy(&self) -> bool {
        self.current.load(Ordering::Acquire) != 0
    }

    pub fn force_clear(&self) {
        self.current.store(0, Ordering::Release);
    }
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        let _ = self
            .current
            .compare_exchange(self.id, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let flight = SingleFlight::default();
        let permit = flight.try_acquire().unwrap();
        assert!(flight.is_busy());
        assert!(flight.try_acquire().is_none());
        drop(permit);
        assert!(!flight.is_busy());
        assert!(flight.try_acquire().is_some());
    }

    #[test]
    fn stale_permit_does_not_release_newer_flight() {
        let flight = SingleFlight::default();
        let old = flight.try_acquire().unwrap();
        flight.force_clear();
        let _new = flight.try_acquire().unwrap();
        drop(old);
        assert!(flight.is_busy());
    }
}
