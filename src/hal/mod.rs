//! Hardware Abstraction Layer, containing interfaces
//! for the external collaborators of the boot core.

pub mod counter;
pub mod flash;
pub mod serial;
pub mod time;
pub mod watchdog;

#[cfg(test)]
#[doc(hidden)]
pub mod doubles;
