//! Slot descriptors over a flash device.
//!
//! An area is an opaque small-integer identity plus an offset/size window
//! into the device; handles carry no driver state, so the whole map is plain
//! `Copy` data and the single mutable borrow of the device stays with the
//! caller. The identity scheme is a runtime mapping over the image count
//! rather than a fixed two-image table.

use crate::config::{MAX_IMAGES, MAX_IMAGE_SECTORS, SCRATCH_BUF_SIZE};
use crate::error::{Error, Result};
use crate::hal::flash::{Flash, Sector};

/// Identity of a flash area: scratch, or the primary/secondary slot of an
/// image pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AreaId(pub u8);

impl AreaId {
    pub const SCRATCH: AreaId = AreaId(0);

    pub fn primary(image: u8) -> AreaId {
        AreaId(1 + 2 * image)
    }

    pub fn secondary(image: u8) -> AreaId {
        AreaId(2 + 2 * image)
    }

    /// The image pair this area belongs to. Scratch is shared and reports
    /// image 0.
    pub fn image(self) -> u8 {
        if self.0 == 0 {
            0
        } else {
            (self.0 - 1) / 2
        }
    }

    pub fn is_primary(self) -> bool {
        self.0 != 0 && self.0 % 2 == 1
    }

    pub fn is_secondary(self) -> bool {
        self.0 != 0 && self.0 % 2 == 0
    }
}

/// A contiguous window of the flash device holding one slot (or scratch).
#[derive(Copy, Clone, Debug)]
pub struct FlashArea {
    pub id: AreaId,
    /// Device-relative offset of the window start. Sector-aligned.
    pub off: u32,
    /// Window size in bytes. Covers whole sectors.
    pub size: u32,
}

impl FlashArea {
    fn check(&self, off: u32, len: usize) -> Result<()> {
        let end = off.checked_add(len as u32).ok_or(Error::NoPayload)?;
        if end > self.size {
            return Err(Error::NoPayload);
        }
        Ok(())
    }

    pub fn read<F: Flash>(&self, flash: &mut F, off: u32, bytes: &mut [u8]) -> Result<()> {
        self.check(off, bytes.len())?;
        flash.read(self.off + off, bytes).map_err(|_| {
            error!("flash read failed, area {=u8} off {=u32}", self.id.0, off);
            Error::Flash("read")
        })
    }

    pub fn write<F: Flash>(&self, flash: &mut F, off: u32, bytes: &[u8]) -> Result<()> {
        self.check(off, bytes.len())?;
        flash.write(self.off + off, bytes).map_err(|_| {
            error!("flash write failed, area {=u8} off {=u32}", self.id.0, off);
            Error::Flash("write")
        })
    }

    /// Erases the sectors covering exactly `[off, off + len)`.
    pub fn erase<F: Flash>(&self, flash: &mut F, off: u32, len: u32) -> Result<()> {
        self.check(off, len as usize)?;
        flash.erase(self.off + off, len).map_err(|_| {
            error!("flash erase failed, area {=u8} off {=u32}", self.id.0, off);
            Error::Flash("erase")
        })
    }

    /// The sector containing area-relative `off`, with the descriptor
    /// rebased to area-relative offsets.
    pub fn sector_at<F: Flash>(&self, flash: &F, off: u32) -> Result<Sector> {
        self.check(off, 0)?;
        let sector = flash.sector_at(self.off + off).ok_or(Error::Flash("no sector"))?;
        Ok(Sector { off: sector.off - self.off, size: sector.size })
    }

    /// Erases every sector intersecting `[off, off + len)`.
    pub fn erase_region<F: Flash>(&self, flash: &mut F, off: u32, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let first = self.sector_at(flash, off)?;
        let last = self.sector_at(flash, off + len - 1)?;
        self.erase(flash, first.off, last.end() - first.off)
    }

    /// Removes stale state from `[off, off + len)`: erases the covering
    /// sectors on erase-style flash, overwrites with the erased pattern on
    /// byte-addressable storage.
    pub fn scramble<F: Flash>(&self, flash: &mut F, off: u32, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if flash.requires_erase() {
            return self.erase_region(flash, off, len);
        }
        let align = flash.align();
        let start = off - off % align;
        let end = off + len;
        let end = end.checked_next_multiple_of(align).ok_or(Error::NoPayload)?;
        let pattern = [flash.erased_val(); SCRATCH_BUF_SIZE];
        let mut cursor = start;
        while cursor < end {
            let chunk = (end - cursor).min(SCRATCH_BUF_SIZE as u32);
            self.write(flash, cursor, &pattern[..chunk as usize])?;
            cursor += chunk;
        }
        Ok(())
    }

    /// Whether `[off, off + len)` reads entirely as the erased value.
    pub fn is_erased<F: Flash>(&self, flash: &mut F, off: u32, len: u32) -> Result<bool> {
        let erased = flash.erased_val();
        let mut buf = [0u8; SCRATCH_BUF_SIZE];
        let mut cursor = off;
        let end = off + len;
        while cursor < end {
            let chunk = ((end - cursor) as usize).min(SCRATCH_BUF_SIZE);
            self.read(flash, cursor, &mut buf[..chunk])?;
            if buf[..chunk].iter().any(|b| *b != erased) {
                return Ok(false);
            }
            cursor += chunk as u32;
        }
        Ok(true)
    }
}

/// The geometry of every area the boot core owns, built by the port.
#[derive(Copy, Clone)]
pub struct FlashMap {
    areas: [Option<FlashArea>; 2 * MAX_IMAGES + 1],
    /// Number of image pairs in use.
    pub image_count: u8,
}

impl FlashMap {
    pub fn new(image_count: u8) -> Self {
        FlashMap { areas: [None; 2 * MAX_IMAGES + 1], image_count }
    }

    pub fn add(mut self, area: FlashArea) -> Self {
        self.areas[area.id.0 as usize] = Some(area);
        self
    }

    /// Looks up an area by identity; this is the whole of "opening" it.
    pub fn open(&self, id: AreaId) -> Result<FlashArea> {
        self.areas
            .get(id.0 as usize)
            .copied()
            .flatten()
            .ok_or(Error::Flash("unknown flash area"))
    }

    pub fn scratch(&self) -> Option<FlashArea> {
        self.areas[AreaId::SCRATCH.0 as usize]
    }
}

/// The sector layout of one area, offsets rebased to the area.
#[derive(Copy, Clone)]
pub struct SectorMap {
    sectors: [Sector; MAX_IMAGE_SECTORS],
    len: usize,
}

impl SectorMap {
    pub fn of_area<F: Flash>(flash: &F, area: &FlashArea) -> Result<SectorMap> {
        let mut map =
            SectorMap { sectors: [Sector { off: 0, size: 0 }; MAX_IMAGE_SECTORS], len: 0 };
        let mut off = 0u32;
        while off < area.size {
            let sector = flash.sector_at(area.off + off).ok_or(Error::Flash("no sector"))?;
            if map.len == MAX_IMAGE_SECTORS {
                return Err(Error::BadState("too many sectors in slot"));
            }
            map.sectors[map.len] = Sector { off, size: sector.size };
            map.len += 1;
            off += sector.size;
        }
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Sector {
        debug_assert!(index < self.len);
        self.sectors[index]
    }

    /// Index and descriptor of the sector containing `off`.
    pub fn containing(&self, off: u32) -> Option<(usize, Sector)> {
        self.sectors[..self.len]
            .iter()
            .copied()
            .enumerate()
            .find(|(_, s)| s.contains(off))
    }

    /// Number of leading sectors needed to cover `len` bytes.
    pub fn covering(&self, len: u32) -> Option<usize> {
        let mut covered = 0u32;
        for i in 0..self.len {
            if covered >= len {
                return Some(i);
            }
            covered += self.sectors[i].size;
        }
        (covered >= len).then_some(self.len)
    }

    /// True when every sector has the same size as in `other`.
    pub fn matches(&self, other: &SectorMap) -> bool {
        self.len == other.len
            && (0..self.len).all(|i| self.sectors[i].size == other.sectors[i].size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::doubles::flash::FakeFlash;

    fn area(off: u32, size: u32) -> FlashArea {
        FlashArea { id: AreaId::primary(0), off, size }
    }

    #[test]
    fn area_ids_map_images_both_ways() {
        assert_eq!(AreaId::primary(0), AreaId(1));
        assert_eq!(AreaId::secondary(0), AreaId(2));
        assert_eq!(AreaId::primary(1), AreaId(3));
        assert_eq!(AreaId::secondary(1).image(), 1);
        assert!(AreaId::primary(1).is_primary());
        assert!(!AreaId::SCRATCH.is_primary());
    }

    #[test]
    fn reads_and_writes_are_window_bounded() {
        let mut flash = FakeFlash::new(&[(4, 0x100)], 8);
        let area = area(0x100, 0x100);
        let mut buf = [0u8; 8];
        assert!(area.read(&mut flash, 0x100, &mut buf).is_err());
        area.write(&mut flash, 0, &[7u8; 8]).unwrap();
        area.read(&mut flash, 0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);
        // the write landed inside the window, not at device offset 0
        let mut raw = [0u8; 8];
        flash.read(0x100, &mut raw).unwrap();
        assert_eq!(raw, [7u8; 8]);
    }

    #[test]
    fn erase_region_rounds_to_sector_boundaries() {
        let mut flash = FakeFlash::new(&[(4, 0x100)], 8);
        let area = area(0, 0x400);
        area.write(&mut flash, 0x100, &[1u8; 8]).unwrap();
        area.write(&mut flash, 0x2f8, &[1u8; 8]).unwrap();
        area.erase_region(&mut flash, 0x180, 0x100).unwrap();
        assert!(area.is_erased(&mut flash, 0x100, 0x200).unwrap());
    }

    #[test]
    fn scramble_overwrites_when_erase_is_not_required() {
        let mut flash = FakeFlash::new(&[(2, 0x100)], 8);
        flash.no_erase_required();
        let area = area(0, 0x200);
        area.write(&mut flash, 0x10, &[0xabu8; 16]).unwrap();
        area.scramble(&mut flash, 0x10, 16).unwrap();
        assert!(area.is_erased(&mut flash, 0x10, 16).unwrap());
        // neighbours untouched
        assert!(area.is_erased(&mut flash, 0, 0x10).unwrap());
    }

    #[test]
    fn sector_map_reflects_layout() {
        let flash = FakeFlash::new(&[(2, 0x100), (1, 0x400)], 8);
        let map = SectorMap::of_area(&flash, &area(0, 0x600)).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(2).size, 0x400);
        assert_eq!(map.containing(0x180).unwrap().0, 1);
        assert_eq!(map.covering(0x200), Some(2));
        assert_eq!(map.covering(0x201), Some(3));
        assert_eq!(map.covering(0x601), None);
    }

    #[test]
    fn map_lookup_requires_registration() {
        let map = FlashMap::new(1).add(area(0, 0x100));
        assert!(map.open(AreaId::primary(0)).is_ok());
        assert!(map.open(AreaId::secondary(0)).is_err());
        assert!(map.scratch().is_none());
    }
}
