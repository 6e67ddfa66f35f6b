//! Clock implementations

use crate::traits::Clock;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Wall clock backed by `std::time` and `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time immediately.
///
/// An optional tick is added on every `now()` call, which lets tests model
/// work that takes time without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    tick: Duration,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_tick(Duration::ZERO)
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            tick,
        }
    }

    /// Move virtual time forward
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += duration;
    }

    /// Virtual time elapsed since construction
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let mut offset = self.offset.lock().unwrap_or_else(|p| p.into_inner());
        *offset += self.tick;
        self.origin + *offset
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
