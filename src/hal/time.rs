//! Time units.

use core::ops::{Add, Sub};

/// A span (or monotonic instant) in milliseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Milliseconds(pub u32);

impl Add for Milliseconds {
    type Output = Milliseconds;
    fn add(self, rhs: Milliseconds) -> Milliseconds {
        Milliseconds(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Milliseconds {
    type Output = Milliseconds;
    fn sub(self, rhs: Milliseconds) -> Milliseconds {
        Milliseconds(self.0.wrapping_sub(rhs.0))
    }
}

/// A source of monotonic time.
pub trait Now {
    fn now(&mut self) -> Milliseconds;
}
