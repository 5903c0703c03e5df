//! Engine-wide in-flight request limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts inbound requests being processed and rejects new ones past `max`.
#[derive(Debug, Default)]
pub struct InFlight {
    max: AtomicUsize,
    current: AtomicUsize,
}

impl InFlight {
    /// `max = 0` disables the limit.
    pub fn new(max: usize) -> Self {
        Self {
            max: AtomicUsize::new(max),
            current: AtomicUsize::new(0),
        }
    }

    pub fn set_max(&self, max: usize) {
        self.max.store(max, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Take a slot, or return the number of requests already in flight.
    pub fn try_acquire(self: &Arc<Self>) -> Result<InFlightGuard, usize> {
        let mut current = self.current.load(Ordering::SeqCst);
        loop {
            let max = self.max();
            if max > 0 && current >= max {
                return Err(current);
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(InFlightGuard(self.clone())),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Releases its slot on drop.
#[derive(Debug)]
pub struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}
