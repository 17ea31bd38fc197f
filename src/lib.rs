#![cfg_attr(not(test), no_std)]

//! Crash-safe secure bootloader core for 32-bit microcontrollers.
//!
//! On every reset the boot driver decides which firmware image is authentic
//! and most appropriate to execute, installs a pending update so that a power
//! loss at any instant leaves the system recoverable, and returns the entry
//! point of the image to run. Hardware access goes exclusively through the
//! traits in [`hal`]; everything else is portable core logic.

#[macro_use]
mod fmt;

pub mod hal;

pub mod area;
pub mod bootloader;
pub mod config;
pub mod crypto;
pub mod enc;
pub mod error;
pub mod hardened;
pub mod image;
pub mod keys;
pub mod recovery;
pub mod shared_data;
pub mod swap;

pub use bootloader::{BootResponse, Bootloader};
pub use error::{Error, Result};
