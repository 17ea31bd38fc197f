//! Deterministic clock.

use crate::hal::time::{Milliseconds, Now};

/// Advances a fixed amount on every query.
pub struct MockClock {
    pub current: Milliseconds,
    pub step: Milliseconds,
}

impl Default for MockClock {
    fn default() -> Self {
        MockClock { current: Milliseconds(0), step: Milliseconds(1) }
    }
}

impl Now for MockClock {
    fn now(&mut self) -> Milliseconds {
        self.current = self.current + self.step;
        self.current
    }
}
