//! Shutdown propagation.
//!
//! One signal is created by the binary and cloned top-down into every
//! controller, sink call, and housekeeping thread. Long-running work
//! either polls [`ShutdownSignal::triggered`] between steps or waits
//! with [`ShutdownSignal::sleep_unless_triggered`], so a shutdown is
//! observed within one wake tick instead of a full sleep interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often sleeping threads re-check the flag.
const WAKE_TICK: Duration = Duration::from_millis(100);

/// Shared shutdown flag. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of a clone to wind down.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
    }

    /// Whether shutdown has been requested.
    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Sleep for `total`, waking early on shutdown. Returns true when
    /// the full duration elapsed, false when the wait was cut short.
    ///
    /// Housekeeping loops use this as their condition, so each pass runs
    /// only after a full quiet interval:
    ///
    /// ```ignore
    /// while shutdown.sleep_unless_triggered(interval) {
    ///     run_periodic_pass();
    /// }
    /// ```
    pub fn sleep_unless_triggered(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(WAKE_TICK));
        }
    }
}
