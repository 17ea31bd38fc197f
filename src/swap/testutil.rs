//! Shared fixture for exercising swap strategies against the fake flash.

use super::trailer::{SwapType, TrailerLayout};
use super::{BootStatus, EncInfo, SwapContext, SwapPolicy};
use crate::area::{AreaId, FlashArea, SectorMap};
use crate::hal::doubles::flash::FakeFlash;

pub const SLOT_SIZE: u32 = 0x4000;
pub const SECTOR: u32 = 0x400;

/// Two slots plus scratch on one device, with pattern "images" whose bytes
/// make misplaced sectors obvious.
#[derive(Clone)]
pub struct Fixture {
    pub flash: FakeFlash,
    pub primary: FlashArea,
    pub secondary: FlashArea,
    pub scratch: FlashArea,
    pub layout: TrailerLayout,
    pub policy: SwapPolicy,
    pub sec_data_off: u32,
    pub swap_size: u32,
    pub enc_primary: Option<EncInfo>,
    pub enc_secondary: Option<EncInfo>,
    pub watchdog: (),
}

fn pattern(seed: u8, len: u32) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

impl Fixture {
    pub fn new(policy: SwapPolicy) -> Fixture {
        let flash = FakeFlash::new(&[(34, SECTOR)], 8);
        Self::with_flash(flash, SLOT_SIZE, policy)
    }

    /// Primary in 1K sectors, secondary and scratch in 2K sectors.
    pub fn new_mixed_sectors() -> Fixture {
        let flash = FakeFlash::new(&[(16, SECTOR), (8, 0x800), (2, 0x800)], 8);
        let mut fx = Self::with_flash(flash, SLOT_SIZE, SwapPolicy::Scratch);
        fx.scratch = FlashArea { id: AreaId::SCRATCH, off: 2 * SLOT_SIZE, size: 0x1000 };
        fx
    }

    fn with_flash(flash: FakeFlash, slot_size: u32, policy: SwapPolicy) -> Fixture {
        let layout = TrailerLayout::new(&flash, true);
        let sec_data_off = if policy == SwapPolicy::Offset { SECTOR } else { 0 };
        Fixture {
            primary: FlashArea { id: AreaId::primary(0), off: 0, size: slot_size },
            secondary: FlashArea { id: AreaId::secondary(0), off: slot_size, size: slot_size },
            scratch: FlashArea { id: AreaId::SCRATCH, off: 2 * slot_size, size: 0x800 },
            layout,
            policy,
            sec_data_off,
            swap_size: 0,
            enc_primary: None,
            enc_secondary: None,
            watchdog: (),
            flash,
        }
    }

    /// Installs an old image in the primary and a new one in the secondary
    /// (at the policy's data offset). Returns (old, new) bytes.
    pub fn install_pair(&mut self, old_len: u32, new_len: u32) -> (Vec<u8>, Vec<u8>) {
        let old = pattern(0x11, old_len);
        let new = pattern(0x77, new_len);
        self.flash.install(self.primary.off, &old);
        self.flash.install(self.secondary.off + self.sec_data_off, &new);
        self.swap_size = old_len.max(new_len);
        (old, new)
    }

    pub fn fresh_status(&self, swap_type: SwapType) -> BootStatus {
        BootStatus::fresh(swap_type, self.swap_size)
    }

    pub fn context(&mut self) -> SwapContext<'_, FakeFlash, ()> {
        let primary_sectors = SectorMap::of_area(&self.flash, &self.primary).unwrap();
        let secondary_sectors = SectorMap::of_area(&self.flash, &self.secondary).unwrap();
        SwapContext {
            primary: self.primary,
            secondary: self.secondary,
            scratch: Some(self.scratch),
            primary_sectors,
            secondary_sectors,
            layout: self.layout,
            image_index: 0,
            enc_primary: self.enc_primary,
            enc_secondary: self.enc_secondary,
            sec_data_off: self.sec_data_off,
            flash: &mut self.flash,
            watchdog: &mut self.watchdog,
        }
    }

    fn slot_bytes(&mut self, area: FlashArea, off: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        area.read(&mut self.flash, off, &mut buf).unwrap();
        buf
    }

    pub fn assert_primary_holds(&mut self, image: &[u8]) {
        let got = self.slot_bytes(self.primary, 0, image.len());
        assert_eq!(got, image, "primary slot contents diverge");
    }

    /// After an upgrade the displaced image sits at secondary offset 0
    /// regardless of policy; reverts restore the policy offset.
    pub fn assert_secondary_holds(&mut self, image: &[u8]) {
        self.assert_secondary_holds_at(0, image);
    }

    pub fn assert_secondary_holds_at(&mut self, off: u32, image: &[u8]) {
        let got = self.slot_bytes(self.secondary, off, image.len());
        assert_eq!(got, image, "secondary slot contents diverge");
    }
}
