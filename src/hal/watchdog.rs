//! Hardware watchdog hook.
//!
//! The swap engine feeds the watchdog between sector operations so a slow
//! upgrade on large sectors does not trip a board-level reset.

pub trait Watchdog {
    fn feed(&mut self);
}

/// For boards without a watchdog, or with one the port manages itself.
impl Watchdog for () {
    fn feed(&mut self) {}
}
