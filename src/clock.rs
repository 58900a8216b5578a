//! Commit clock.
//!
//! Timestamps are UTC ticks: 100 ns units since the Unix epoch. Entry
//! timestamps and lock request ordering both read from a `Clock`, which lets
//! tests drive time by hand.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TICKS_PER_MILLISECOND: i64 = 10_000;

pub trait Clock: Send + Sync {
    fn now_ticks(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ticks(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (elapsed.as_nanos() / 100) as i64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            ticks: AtomicI64::new(start),
        }
    }

    pub fn set(&self, ticks: i64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: i64) -> i64 {
        self.ticks.fetch_add(ticks, Ordering::SeqCst) + ticks
    }
}

impl Clock for ManualClock {
    fn now_ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// Next commit timestamp for an entry last committed at `previous`.
pub fn next_timestamp(clock: &dyn Clock, previous: i64) -> i64 {
    clock.now_ticks().max(previous + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_2020() {
        // 2020-01-01 in ticks since the Unix epoch
        let jan_2020 = 1_577_836_800_000 * TICKS_PER_MILLISECOND;
        assert!(SystemClock.now_ticks() > jan_2020);
    }

    #[test]
    fn test_next_timestamp_never_goes_backwards() {
        let clock = ManualClock::new(100);

        assert_eq!(next_timestamp(&clock, 50), 100);
        assert_eq!(next_timestamp(&clock, 100), 101);
        assert_eq!(next_timestamp(&clock, 500), 501);

        clock.advance(1_000);
        assert_eq!(next_timestamp(&clock, 500), 1_100);
    }
}
