//! Loop clock.
//!
//! The loop caches a monotonic microsecond reading once per iteration so
//! timer comparisons within a pass all see the same instant. Wall time is
//! read fresh; only calendar timers use it.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub(crate) struct Clock {
    start: Instant,
    cached_hrtime_us: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            cached_hrtime_us: 0,
        }
    }

    /// Refresh the cached monotonic reading.
    pub fn update(&mut self) {
        self.cached_hrtime_us = self.start.elapsed().as_micros() as u64;
    }

    /// Cached monotonic microseconds since loop creation.
    #[inline]
    pub fn hrtime_us(&self) -> u64 {
        self.cached_hrtime_us
    }

    /// Wall-clock microseconds since the epoch.
    pub fn realtime_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    /// Wall-clock seconds since the epoch.
    pub fn realtime_secs(&self) -> i64 {
        (self.realtime_us() / 1_000_000) as i64
    }
}
