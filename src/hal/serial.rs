//! Interface to the serial device used for recovery.
//!
//! Writes go through the **nb** crate so ports can stay scheduler-friendly;
//! the core drives them with the block! macro. Reads take an explicit
//! timeout because the recovery wait-for-client window is a parameter of the
//! handler, not a property of the wire.

use core::fmt::Debug;

use super::time::Milliseconds;

/// UART read half with a bounded wait.
pub trait TimeoutRead {
    type Error: Copy + Clone + Debug;

    /// Reads a single byte, giving up after `timeout`.
    fn read(&mut self, timeout: Milliseconds) -> Result<u8, Self::Error>;
}

/// UART write half.
pub trait Write {
    type Error: Copy + Clone + Debug;

    /// Writes a single byte.
    fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        for byte in bytes {
            nb::block!(self.write(*byte))?;
        }
        Ok(())
    }
}
