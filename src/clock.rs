/// Monotonic time source injected into the link, supervisor, scheduler and
/// WIPS engine so state machines can be driven by a fake clock in tests.
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Wall-clock monotonic time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Milliseconds elapsed between two instants, saturating at `u32::MAX`.
pub fn millis_since(earlier: Instant, now: Instant) -> u32 {
    now.saturating_duration_since(earlier)
        .as_millis()
        .min(u32::MAX as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance_ms(1500);
        assert_eq!(millis_since(start, clock.now()), 1500);
    }

    #[test]
    fn millis_since_saturates_backwards() {
        let clock = ManualClock::new();
        let later = {
            clock.advance_ms(10);
            clock.now()
        };
        let earlier = later - Duration::from_millis(10);
        assert_eq!(millis_since(later, earlier), 0);
    }

    #[test]
    fn shared_clock_through_arc() {
        let clock = Arc::new(ManualClock::new());
        let dynamic: Arc<dyn Clock> = clock.clone();
        let t0 = dynamic.now();
        clock.advance_ms(5);
        assert_eq!(millis_since(t0, dynamic.now()), 5);
    }
}
