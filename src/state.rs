//! Per-driver state shared between the iteration task and the listener tasks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::time::Instant;

/// Counters and flags mutated by the message-arrival tasks and read by the
/// driver's iteration logic.
///
/// `stopping` is the single cooperative cancellation token: every blocking or
/// retry loop in the harness observes it within one polling interval. It
/// never transitions back to `false`.
#[derive(Debug, Default)]
pub struct DriverShared {
    stopping: AtomicBool,
    arrived: AtomicU32,
    errors: AtomicU32,
    measuring: AtomicBool,
    roundtrip_ms: AtomicU64,
    measure_start: Mutex<Option<Instant>>,
}

impl DriverShared {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn arrived(&self) -> u32 {
        self.arrived.load(Ordering::Relaxed)
    }

    /// Increments the arrival counter, returning the new value.
    pub fn record_arrival(&self) -> u32 {
        self.arrived.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_arrived(&self) {
        self.arrived.store(0, Ordering::Relaxed);
    }

    /// Cumulative error count for the driver's lifetime; never reset, so a
    /// violation in any iteration fails every later verdict.
    #[must_use]
    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks the start of a calibration phase at `now`.
    pub fn begin_measurement(&self, now: Instant) {
        *self.measure_start.lock().expect("measure_start poisoned") = Some(now);
        self.measuring.store(true, Ordering::SeqCst);
    }

    pub fn end_measurement(&self) {
        self.measuring.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::SeqCst)
    }

    /// Captures the calibration round-trip sample from the measurement start.
    pub fn record_roundtrip(&self) {
        let start = self.measure_start.lock().expect("measure_start poisoned");
        if let Some(start) = *start {
            let elapsed = start.elapsed().as_millis() as u64;
            self.roundtrip_ms.store(elapsed, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn roundtrip_ms(&self) -> u64 {
        self.roundtrip_ms.load(Ordering::SeqCst)
    }
}
