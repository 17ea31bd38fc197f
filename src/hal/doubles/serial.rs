//! Scripted serial device.

use std::collections::VecDeque;

use crate::hal::serial::{TimeoutRead, Write};
use crate::hal::time::Milliseconds;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeout;

#[derive(Default)]
pub struct MockSerial {
    pub incoming: VecDeque<u8>,
    pub sent: Vec<u8>,
}

impl MockSerial {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.incoming.extend(bytes.iter().copied());
    }
}

impl TimeoutRead for MockSerial {
    type Error = Timeout;

    fn read(&mut self, _timeout: Milliseconds) -> Result<u8, Timeout> {
        self.incoming.pop_front().ok_or(Timeout)
    }
}

impl Write for MockSerial {
    type Error = Timeout;

    fn write(&mut self, byte: u8) -> nb::Result<(), Timeout> {
        self.sent.push(byte);
        Ok(())
    }
}
