//! Concurrency gate.
//!
//! Tracks how many jobs are in flight against a fixed ceiling. The
//! check-and-increment in [`ConcurrencyGate::try_acquire`] is a single
//! compare-exchange on the current counter value, so two concurrent callers
//! can never both take the last free slot.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::{EngineError, Result};

/// Counter of in-flight jobs bounded by a fixed ceiling.
#[derive(Debug)]
pub struct ConcurrencyGate {
    ceiling: usize,
    in_flight: AtomicUsize,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `ceiling` jobs at once.
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Take a slot if one is free.
    ///
    /// Returns `true` and increments the in-flight count only when the count
    /// observed at the moment of the exchange is below the ceiling.
    pub fn try_acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.ceiling).then_some(current + 1)
            })
            .is_ok()
    }

    /// Give back a slot taken by a successful [`try_acquire`](Self::try_acquire).
    ///
    /// Releasing with nothing in flight is a caller defect; the counter is
    /// left at zero and `GateUnderflow` is returned.
    pub fn release(&self) -> Result<()> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .map(|_| ())
            .map_err(|_| {
                warn!(ceiling = self.ceiling, "Concurrency gate released with nothing in flight");
                EngineError::GateUnderflow
            })
    }

    /// Number of slots currently taken.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Maximum number of slots.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.ceiling.saturating_sub(self.in_flight())
    }

    /// Whether every slot is taken.
    pub fn is_saturated(&self) -> bool {
        self.available() == 0
    }
}
