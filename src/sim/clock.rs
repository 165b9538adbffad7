use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::chain::Clock;

/// Shared simulated time. Clones observe the same instant, so the chains
/// and the withdrawal coordinator agree on "now".
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
    frozen: bool,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
            frozen: false,
        }
    }

    /// Sleeping does not move a frozen clock; only `advance` does.
    pub fn frozen(now: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
            frozen: true,
        }
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    pub fn advance(&self, secs: u64) {
        self.now.set(self.now.get().saturating_add(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        ManualClock::now(self)
    }

    fn sleep(&self, duration: Duration) {
        if !self.frozen {
            self.advance(duration.as_secs());
        }
    }
}
