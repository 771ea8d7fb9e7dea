//! Injected monotonic clock so the health-wait poll loop and elapsed-time
//! reporting can be driven deterministically in tests (spec S2, S5).

use std::time::{Duration, Instant};

/// Abstraction over time so tests don't need to actually sleep.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
pub mod fake {
    use super::Clock;
    use std::cell::RefCell;
    use std::time::{Duration, Instant};

    /// A clock whose `now()` only advances when `sleep` is called (or
    /// `advance` is called directly), so poll-loop tests can assert exact
    /// boundary behavior without wall-clock flakiness.
    pub struct FakeClock {
        origin: Instant,
        elapsed: RefCell<Duration>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            FakeClock {
                origin: Instant::now(),
                elapsed: RefCell::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, by: Duration) {
            *self.elapsed.borrow_mut() += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.origin + *self.elapsed.borrow()
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }
}
