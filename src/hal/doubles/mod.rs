//! Test doubles for the HAL traits. Host-only.

pub mod counter;
pub mod flash;
pub mod serial;
pub mod time;
