//! Monotonic elapsed-time measurement for calibration and drain phases.

use tokio::time::{Duration, Instant};

/// Poll granularity for all blocking waits in the harness.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A started monotonic clock.
///
/// Uses `tokio::time::Instant` so paused-clock tests advance it together with
/// the sleeps that surround it.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    #[must_use]
    pub fn elapsed_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }
}
