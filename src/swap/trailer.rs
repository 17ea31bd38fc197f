//! Slot trailer: the bookkeeping fields at the high end of each slot.
//!
//! Field order from the end of the slot: magic (16 bytes), image_ok,
//! copy_done, swap_info, swap_size, optional encryption key fields, then the
//! per-sector swap status log. Every field is padded to the platform's
//! maximum write alignment; a field whose bytes all read as the flash
//! erased value is unset.

use crate::area::FlashArea;
use crate::config::MAX_IMAGE_SECTORS;
use crate::enc::KEY_FIELD_LEN;
use crate::error::{Error, Result};
use crate::hal::flash::Flash;

/// Encoded magic size.
pub const MAGIC_SZ: u32 = 16;

/// Trailer flag byte for a set flag.
pub const FLAG_SET: u8 = 0x01;

/// Canonical magic when the maximum write alignment is 8 bytes.
const MAGIC_FIXED: [u8; 16] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79,
    0x80,
];

/// Tail of the alignment-prefixed magic used for larger write alignments.
const MAGIC_TAIL: [u8; 14] = [
    0x2d, 0xe1, 0x5d, 0x29, 0x41, 0x0b, 0x8d, 0x77, 0x67, 0x9c, 0x11, 0x0f, 0x1f, 0x8a,
];

/// The canonical magic for a platform alignment. Exactly one form is valid
/// per platform.
pub fn magic_for(max_align: u32) -> [u8; 16] {
    if max_align <= 8 {
        MAGIC_FIXED
    } else {
        let mut magic = [0u8; 16];
        magic[..2].copy_from_slice(&(max_align as u16).to_le_bytes());
        magic[2..].copy_from_slice(&MAGIC_TAIL);
        magic
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MagicState {
    Good,
    Bad,
    Unset,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlagState {
    Set,
    Bad,
    Unset,
}

/// What the next boot should do with an image pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapType {
    None,
    Test,
    Perm,
    Revert,
    Fail,
    /// Unrecoverable trailer state observed mid-resume; never persisted.
    Panic,
}

impl SwapType {
    /// Low nibble of the swap_info byte.
    pub fn to_nibble(self) -> u8 {
        match self {
            SwapType::None => 1,
            SwapType::Test => 2,
            SwapType::Perm => 3,
            SwapType::Revert => 4,
            SwapType::Fail => 5,
            SwapType::Panic => 0xf,
        }
    }

    fn from_nibble(nibble: u8) -> Option<SwapType> {
        match nibble {
            1 => Some(SwapType::None),
            2 => Some(SwapType::Test),
            3 => Some(SwapType::Perm),
            4 => Some(SwapType::Revert),
            _ => None,
        }
    }

    pub fn is_upgrade(self) -> bool {
        matches!(self, SwapType::Test | SwapType::Perm | SwapType::Revert)
    }
}

/// Decoded trailer of one slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwapState {
    pub magic: MagicState,
    pub swap_type: SwapType,
    pub image_num: u8,
    pub copy_done: FlagState,
    pub image_ok: FlagState,
}

/// Field geometry of a trailer. `max_align` pads the metadata fields and
/// selects the magic form; `write_sz` spaces the status entries.
#[derive(Copy, Clone, Debug)]
pub struct TrailerLayout {
    pub max_align: u32,
    pub write_sz: u32,
    pub has_enc: bool,
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

fn align_down(value: u32, align: u32) -> u32 {
    value - value % align
}

impl TrailerLayout {
    pub fn new<F: Flash>(flash: &F, has_enc: bool) -> TrailerLayout {
        let align = flash.align();
        TrailerLayout { max_align: align.max(8), write_sz: align, has_enc }
    }

    fn magic_align_sz(&self) -> u32 {
        align_up(MAGIC_SZ, self.max_align)
    }

    fn enc_field_sz(&self) -> u32 {
        align_up(KEY_FIELD_LEN as u32, self.max_align)
    }

    pub fn magic_off(&self, area: &FlashArea) -> u32 {
        area.size - MAGIC_SZ
    }

    pub fn image_ok_off(&self, area: &FlashArea) -> u32 {
        align_down(self.magic_off(area), self.max_align) - self.max_align
    }

    pub fn copy_done_off(&self, area: &FlashArea) -> u32 {
        self.image_ok_off(area) - self.max_align
    }

    pub fn swap_info_off(&self, area: &FlashArea) -> u32 {
        self.copy_done_off(area) - self.max_align
    }

    pub fn swap_size_off(&self, area: &FlashArea) -> u32 {
        self.swap_info_off(area) - self.max_align
    }

    pub fn enc_key_off(&self, area: &FlashArea, slot: u8) -> u32 {
        self.swap_size_off(area) - u32::from(slot + 1) * self.enc_field_sz()
    }

    /// Metadata bytes between the status log and the end of the slot.
    fn info_sz(&self) -> u32 {
        let enc = if self.has_enc { 2 * self.enc_field_sz() } else { 0 };
        self.magic_align_sz() + 4 * self.max_align + enc
    }

    /// Full trailer size for an image slot.
    pub fn trailer_sz(&self) -> u32 {
        3 * MAX_IMAGE_SECTORS as u32 * self.write_sz + self.info_sz()
    }

    /// Trailer size for the scratch area, whose status log holds the three
    /// entries of the in-flight step only.
    pub fn scratch_trailer_sz(&self) -> u32 {
        3 * self.write_sz + self.info_sz()
    }

    /// Start of the status log.
    pub fn status_off(&self, area: &FlashArea, is_scratch: bool) -> u32 {
        if is_scratch {
            area.size - self.scratch_trailer_sz()
        } else {
            area.size - self.trailer_sz()
        }
    }
}

fn buffer_is_erased(erased: u8, buf: &[u8]) -> bool {
    !buf.is_empty() && buf.iter().all(|b| *b == erased)
}

/// Writes a trailer field padded up to the write block with erased bytes.
fn write_field<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
    off: u32,
    data: &[u8],
) -> Result<()> {
    let mut buf = [0u8; crate::config::MAX_WRITE_ALIGN];
    let len = align_up(data.len() as u32, layout.write_sz) as usize;
    if len > buf.len() {
        return Err(Error::BadState("trailer field exceeds write buffer"));
    }
    buf[..data.len()].copy_from_slice(data);
    for byte in &mut buf[data.len()..len] {
        *byte = flash.erased_val();
    }
    area.write(flash, off, &buf[..len])
}

pub fn write_magic<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
) -> Result<()> {
    // the magic itself is not write-block aligned; pad in front so the
    // write covers whole blocks
    let off = align_down(layout.magic_off(area), layout.max_align);
    let pad = (layout.magic_off(area) - off) as usize;
    let mut buf = [0u8; crate::config::MAX_WRITE_ALIGN + MAGIC_SZ as usize];
    let total = pad + MAGIC_SZ as usize;
    for byte in &mut buf[..pad] {
        *byte = flash.erased_val();
    }
    buf[pad..total].copy_from_slice(&magic_for(layout.max_align));
    area.write(flash, off, &buf[..total])
}

pub fn write_image_ok<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
) -> Result<()> {
    write_field(flash, area, layout, layout.image_ok_off(area), &[FLAG_SET])
}

pub fn write_copy_done<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
) -> Result<()> {
    write_field(flash, area, layout, layout.copy_done_off(area), &[FLAG_SET])
}

/// Persists the swap type and image number so an interrupted swap knows
/// what it was doing after a reset.
pub fn write_swap_info<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
    swap_type: SwapType,
    image_num: u8,
) -> Result<()> {
    let info = (image_num << 4) | swap_type.to_nibble();
    write_field(flash, area, layout, layout.swap_info_off(area), &[info])
}

pub fn write_swap_size<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
    swap_size: u32,
) -> Result<()> {
    write_field(flash, area, layout, layout.swap_size_off(area), &swap_size.to_le_bytes())
}

pub fn read_swap_size<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
) -> Result<u32> {
    let mut buf = [0u8; 4];
    area.read(flash, layout.swap_size_off(area), &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_enc_key<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
    slot: u8,
    key: &[u8; KEY_FIELD_LEN],
) -> Result<()> {
    write_field(flash, area, layout, layout.enc_key_off(area, slot), key)
}

/// The stored key field, or `None` when it reads fully erased.
pub fn read_enc_key<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
    slot: u8,
) -> Result<Option<[u8; KEY_FIELD_LEN]>> {
    let mut buf = [0u8; KEY_FIELD_LEN];
    area.read(flash, layout.enc_key_off(area, slot), &mut buf)?;
    if buffer_is_erased(flash.erased_val(), &buf) {
        Ok(None)
    } else {
        Ok(Some(buf))
    }
}

fn read_flag<F: Flash>(flash: &mut F, area: &FlashArea, off: u32) -> Result<FlagState> {
    let mut buf = [0u8; 1];
    area.read(flash, off, &mut buf)?;
    if buf[0] == flash.erased_val() {
        Ok(FlagState::Unset)
    } else if buf[0] == FLAG_SET {
        Ok(FlagState::Set)
    } else {
        Ok(FlagState::Bad)
    }
}

/// Decodes the whole trailer of one slot into its typed state.
pub fn read_swap_state<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
) -> Result<SwapState> {
    let mut magic = [0u8; MAGIC_SZ as usize];
    area.read(flash, layout.magic_off(area), &mut magic)?;
    let magic = if buffer_is_erased(flash.erased_val(), &magic) {
        MagicState::Unset
    } else if magic == magic_for(layout.max_align) {
        MagicState::Good
    } else {
        MagicState::Bad
    };

    let mut info = [0u8; 1];
    area.read(flash, layout.swap_info_off(area), &mut info)?;
    let (swap_type, image_num) = if info[0] == flash.erased_val() {
        (SwapType::None, 0)
    } else {
        match SwapType::from_nibble(info[0] & 0x0f) {
            Some(swap_type) => (swap_type, info[0] >> 4),
            None => (SwapType::None, 0),
        }
    };

    let copy_done = read_flag(flash, area, layout.copy_done_off(area))?;
    let image_ok = read_flag(flash, area, layout.image_ok_off(area))?;

    Ok(SwapState { magic, swap_type, image_num, copy_done, image_ok })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::AreaId;
    use crate::hal::doubles::flash::FakeFlash;

    fn fixture() -> (FakeFlash, FlashArea, TrailerLayout) {
        let flash = FakeFlash::new(&[(16, 0x1000)], 8);
        let area = FlashArea { id: AreaId::primary(0), off: 0, size: 0x8000 };
        let layout = TrailerLayout::new(&flash, true);
        (flash, area, layout)
    }

    #[test]
    fn fresh_trailer_reads_fully_unset() {
        let (mut flash, area, layout) = fixture();
        let state = read_swap_state(&mut flash, &area, &layout).unwrap();
        assert_eq!(
            state,
            SwapState {
                magic: MagicState::Unset,
                swap_type: SwapType::None,
                image_num: 0,
                copy_done: FlagState::Unset,
                image_ok: FlagState::Unset,
            }
        );
    }

    #[test]
    fn every_field_round_trips_independently() {
        let (mut flash, area, layout) = fixture();
        write_magic(&mut flash, &area, &layout).unwrap();
        write_swap_info(&mut flash, &area, &layout, SwapType::Test, 1).unwrap();
        write_swap_size(&mut flash, &area, &layout, 0x12345).unwrap();
        write_copy_done(&mut flash, &area, &layout).unwrap();
        write_image_ok(&mut flash, &area, &layout).unwrap();

        let state = read_swap_state(&mut flash, &area, &layout).unwrap();
        assert_eq!(state.magic, MagicState::Good);
        assert_eq!(state.swap_type, SwapType::Test);
        assert_eq!(state.image_num, 1);
        assert_eq!(state.copy_done, FlagState::Set);
        assert_eq!(state.image_ok, FlagState::Set);
        assert_eq!(read_swap_size(&mut flash, &area, &layout).unwrap(), 0x12345);
    }

    #[test]
    fn enc_key_fields_round_trip_and_detect_absence() {
        let (mut flash, area, layout) = fixture();
        assert_eq!(read_enc_key(&mut flash, &area, &layout, 0).unwrap(), None);
        let key = [0x42u8; KEY_FIELD_LEN];
        write_enc_key(&mut flash, &area, &layout, 0, &key).unwrap();
        write_enc_key(&mut flash, &area, &layout, 1, &[0x43u8; KEY_FIELD_LEN]).unwrap();
        assert_eq!(read_enc_key(&mut flash, &area, &layout, 0).unwrap(), Some(key));
        assert_ne!(
            read_enc_key(&mut flash, &area, &layout, 1).unwrap(),
            read_enc_key(&mut flash, &area, &layout, 0).unwrap()
        );
    }

    #[test]
    fn non_canonical_magic_reads_bad() {
        let (mut flash, area, layout) = fixture();
        let mut corrupted = magic_for(layout.max_align);
        corrupted[0] ^= 0xff;
        flash.install(area.size - 16, &corrupted);
        let state = read_swap_state(&mut flash, &area, &layout).unwrap();
        assert_eq!(state.magic, MagicState::Bad);
    }

    #[test]
    fn garbage_swap_type_decodes_as_none() {
        let (mut flash, area, layout) = fixture();
        write_field(&mut flash, &area, &layout, layout.swap_info_off(&area), &[0x1b]).unwrap();
        let state = read_swap_state(&mut flash, &area, &layout).unwrap();
        assert_eq!(state.swap_type, SwapType::None);
        assert_eq!(state.image_num, 0);
    }

    #[test]
    fn magic_form_depends_on_alignment() {
        assert_eq!(magic_for(8)[0], 0x77);
        let wide = magic_for(32);
        assert_eq!(&wide[..2], &32u16.to_le_bytes());
        assert_eq!(&wide[2..], &MAGIC_TAIL);
        assert_ne!(magic_for(8), magic_for(16));
    }

    #[test]
    fn layout_offsets_descend_in_field_order() {
        let (_, area, layout) = fixture();
        assert!(layout.magic_off(&area) > layout.image_ok_off(&area));
        assert!(layout.image_ok_off(&area) > layout.copy_done_off(&area));
        assert!(layout.copy_done_off(&area) > layout.swap_info_off(&area));
        assert!(layout.swap_info_off(&area) > layout.swap_size_off(&area));
        assert!(layout.swap_size_off(&area) > layout.enc_key_off(&area, 0));
        assert!(layout.enc_key_off(&area, 0) > layout.enc_key_off(&area, 1));
        assert!(layout.enc_key_off(&area, 1) >= layout.status_off(&area, false));
        assert!(layout.scratch_trailer_sz() < layout.trailer_sz());
    }
}
