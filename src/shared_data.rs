//! Boot information handed to the next stage.
//!
//! Before jumping, the driver serialises a small versioned TLV blob into a
//! reserved RAM region: what ran, how it was verified, and how much room
//! each application slot offers. The next stage parses it instead of
//! re-deriving flash geometry.

use crate::error::{Error, Result};

/// Magic introducing the shared-data block.
pub const INFO_MAGIC: u16 = 0x2016;

/// Blob format version.
pub const VERSION: u8 = 1;

/// Entry types. The high nibble groups bootloader information.
pub mod entry {
    pub const MODE: u16 = 0x0100;
    pub const SIGNATURE_KIND: u16 = 0x0101;
    pub const RECOVERY_KIND: u16 = 0x0102;
    pub const RUNNING_SLOT: u16 = 0x0103;
    pub const BOOTLOADER_VERSION: u16 = 0x0104;
    pub const MAX_APPLICATION_SIZE: u16 = 0x0105;
}

/// What the publisher reports about this boot.
pub struct BootInfo<'a> {
    /// Upgrade mode identifier (the active swap policy).
    pub mode: u8,
    /// Active signature kind identifier.
    pub signature_kind: u8,
    /// Recovery transport identifier (0 none, 1 serial).
    pub recovery_kind: u8,
    /// Slot the returned image runs from.
    pub running_slot: u8,
    /// Version string of this bootloader build.
    pub bootloader_version: &'a str,
    /// Per-image maximum application size.
    pub max_app_sizes: &'a [u32],
}

fn push(buf: &mut [u8], at: &mut usize, bytes: &[u8]) -> Result<()> {
    if *at + bytes.len() > buf.len() {
        return Err(Error::NoPayload);
    }
    buf[*at..*at + bytes.len()].copy_from_slice(bytes);
    *at += bytes.len();
    Ok(())
}

fn push_entry(buf: &mut [u8], at: &mut usize, kind: u16, value: &[u8]) -> Result<()> {
    push(buf, at, &kind.to_le_bytes())?;
    push(buf, at, &(value.len() as u16).to_le_bytes())?;
    push(buf, at, value)
}

/// Serialises the blob into `out` (the reserved RAM region) and returns its
/// length. Layout: magic, total length, version, then TLV entries.
pub fn publish(out: &mut [u8], info: &BootInfo) -> Result<usize> {
    let mut at = 0usize;
    push(out, &mut at, &INFO_MAGIC.to_le_bytes())?;
    // total length patched at the end
    push(out, &mut at, &0u16.to_le_bytes())?;
    push(out, &mut at, &[VERSION, 0])?;

    push_entry(out, &mut at, entry::MODE, &[info.mode])?;
    push_entry(out, &mut at, entry::SIGNATURE_KIND, &[info.signature_kind])?;
    push_entry(out, &mut at, entry::RECOVERY_KIND, &[info.recovery_kind])?;
    push_entry(out, &mut at, entry::RUNNING_SLOT, &[info.running_slot])?;
    push_entry(out, &mut at, entry::BOOTLOADER_VERSION, info.bootloader_version.as_bytes())?;
    for (image, size) in info.max_app_sizes.iter().enumerate() {
        let mut value = [0u8; 5];
        value[0] = image as u8;
        value[1..].copy_from_slice(&size.to_le_bytes());
        push_entry(out, &mut at, entry::MAX_APPLICATION_SIZE, &value)?;
    }

    let total = at as u16;
    out[2..4].copy_from_slice(&total.to_le_bytes());
    Ok(at)
}
