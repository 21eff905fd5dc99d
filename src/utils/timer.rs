//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::RiverError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Supports reseting with
/// a different duration for implementing wakeup-at-earliest-deadline loops.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub(crate) struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Timer {
    /// Creates a new timer utility that immediately times-out after a
    /// zero-length duration.
    pub(crate) fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
        }
    }

    /// Get the last timeout duration used.
    pub(crate) fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Restarts the timer with the given duration.
    pub(crate) fn restart(&mut self, dur: Duration) -> Result<(), RiverError> {
        if dur.is_zero() {
            return Err(RiverError(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Restarts the timer to fire at the given deadline. A deadline in the
    /// past fires on the next poll.
    pub(crate) fn restart_at(&mut self, deadline: Instant) {
        self.last_dur = deadline.saturating_duration_since(Instant::now());
        self.sleep.as_mut().reset(deadline);
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub(crate) async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
