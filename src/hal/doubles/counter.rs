//! RAM-backed anti-rollback counter.

use crate::hal::counter::{CounterError, SecurityCounter};

#[derive(Default)]
pub struct FakeCounter {
    pub values: [u32; 4],
    pub fail: bool,
}

impl FakeCounter {
    pub fn with_value(image: u8, value: u32) -> Self {
        let mut counter = FakeCounter::default();
        counter.values[image as usize] = value;
        counter
    }
}

impl SecurityCounter for FakeCounter {
    fn get(&mut self, image: u8) -> Result<u32, CounterError> {
        if self.fail {
            return Err(CounterError);
        }
        Ok(self.values[image as usize])
    }

    fn update(&mut self, image: u8, value: u32) -> Result<(), CounterError> {
        if self.fail {
            return Err(CounterError);
        }
        let slot = &mut self.values[image as usize];
        if value > *slot {
            *slot = value;
        }
        Ok(())
    }
}
