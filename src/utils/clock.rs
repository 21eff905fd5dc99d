//! Wall-clock abstraction used for all expiration math.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Source of absolute time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time in ms.
    fn now_ms(&self) -> i64;
}

/// Process clock. Reads the epoch once at creation and afterwards advances
/// with `tokio::time::Instant`, so it is monotonic within the process and
/// follows a paused tokio clock in tests.
pub struct SystemClock {
    base_ms: i64,
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        SystemClock {
            base_ms,
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SystemClock({})", self.now_ms())
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed = Instant::now().duration_since(self.anchor);
        self.base_ms.saturating_add(elapsed.as_millis() as i64)
    }
}

/// Manually driven clock for tests of time-dependent logic that does not
/// sleep.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock(AtomicI64::new(start_ms))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[test]
    fn manual_advance() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1250);
        clock.set(7);
        assert_eq!(clock.now_ms(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn system_follows_tokio() {
        let clock = SystemClock::new();
        let t0 = clock.now_ms();
        time::sleep(Duration::from_secs(3)).await;
        let t1 = clock.now_ms();
        assert!(t1 - t0 >= 3000);
        assert!(t1 - t0 < 3100);
    }
}
