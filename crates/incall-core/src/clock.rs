//! Time sources
//!
//! Retention deadlines use monotonic [`tokio::time::Instant`]s so they follow
//! tokio's paused clock in tests. Wall-clock time is only used for timestamps
//! shown to observers and for the emergency-callback window, whose reference
//! point arrives from telephony as epoch millis.

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;

    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Real time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<(Instant, DateTime<Utc>)>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((Instant::now(), Utc::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.0 += by;
        inner.1 += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.lock().0
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        self.inner.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both() {
        let clock = ManualClock::new();
        let start = clock.now();
        let wall = clock.wall_clock();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!((clock.wall_clock() - wall).num_milliseconds(), 250);
    }
}
