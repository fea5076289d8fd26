//! Clock abstraction for health-state arithmetic
//!
//! Health transitions are computed on plain millisecond counts so they stay
//! pure functions of `(state, now)`. Production code reads a monotonic clock
//! driven by tokio's time source, which lets paused-time tests advance it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Source of monotonic milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Milliseconds elapsed since the clock was created, via `tokio::time::Instant`
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        duration_millis(self.origin.elapsed())
    }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn starting_at(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Saturating conversion of a duration to whole milliseconds
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_at(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        assert_eq!(clock.now_millis(), 0);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_millis(), 1_500);
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }
}
