//! The crash-safe swap engine.
//!
//! Four strategies share one progress machinery: an append-only status log
//! in the trailer records every completed sub-step, and each sub-step is
//! ordered so its source bytes survive until the entry certifying the step
//! has committed. From any reset point the log plus the trailer metadata
//! derive a unique resume position whose replay produces the same final
//! layout as an uninterrupted run.

pub mod decision;
pub mod offset;
pub mod overwrite;
pub mod scratch;
pub mod slide;
#[cfg(test)]
pub mod testutil;
pub mod trailer;

use crate::area::{FlashArea, SectorMap};
use crate::config::{MAX_IMAGE_SECTORS, MAX_WRITE_ALIGN, SCRATCH_BUF_SIZE};
use crate::enc::ImageCipher;
use crate::error::{Error, Result};
use crate::hal::flash::Flash;
use crate::hal::watchdog::Watchdog;
use crate::image::tlv::TlvCursor;
use crate::image::ImageHeader;

use trailer::{SwapType, TrailerLayout};

/// The upgrade strategy compiled into the boot driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapPolicy {
    /// Sector-at-a-time exchange through a dedicated scratch area.
    Scratch,
    /// Shift the primary up one sector, then interleave (swap-using-move).
    Slide,
    /// Secondary stored one sector up; exchange without scratch
    /// (swap-using-offset).
    Offset,
    /// One-way install, no revert.
    Overwrite,
}

/// Where the in-progress status log currently lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusSource {
    None,
    Primary,
    Scratch,
}

/// Progress of one swap, persisted through the status log.
#[derive(Copy, Clone, Debug)]
pub struct BootStatus {
    /// Completed sub-steps. Sub-step `op_count` is the next to run.
    pub op_count: u32,
    pub swap_type: SwapType,
    /// Bytes of image data taking part in the exchange.
    pub swap_size: u32,
    pub source: StatusSource,
    /// Entries currently route to the scratch trailer.
    pub use_scratch: bool,
}

impl BootStatus {
    pub fn fresh(swap_type: SwapType, swap_size: u32) -> BootStatus {
        BootStatus {
            op_count: 0,
            swap_type,
            swap_size,
            source: StatusSource::None,
            use_scratch: false,
        }
    }

    /// True when no swap has recorded any progress.
    pub fn is_reset(&self) -> bool {
        self.source == StatusSource::None && self.op_count == 0
    }

    /// Progress record as the resume logic sees it: a monotonically
    /// increasing sector index plus a three-valued state.
    pub fn idx(&self) -> u32 {
        self.op_count / 3
    }

    pub fn state(&self) -> u8 {
        (self.op_count % 3) as u8
    }
}

/// Which physical region a copy touches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Primary,
    Secondary,
    Scratch,
}

/// Cipher plus the geometry of the image it belongs to.
#[derive(Copy, Clone)]
pub struct EncInfo {
    pub cipher: ImageCipher,
    pub hdr_size: u32,
    pub img_size: u32,
}

impl EncInfo {
    /// Applies the cipher to the intersection of the buffer with the image
    /// payload. `image_rel` is the buffer's offset from the image start.
    fn transform(&self, image_rel: u32, buf: &mut [u8]) {
        let start = image_rel;
        let end = image_rel + buf.len() as u32;
        let pay_start = self.hdr_size;
        let pay_end = self.hdr_size + self.img_size;
        let lo = start.max(pay_start);
        let hi = end.min(pay_end);
        if lo >= hi {
            return;
        }
        let slice = &mut buf[(lo - start) as usize..(hi - start) as usize];
        self.cipher.encrypt(lo - pay_start, slice);
    }
}

/// Everything a strategy needs for one image pair.
pub struct SwapContext<'a, F: Flash, W: Watchdog> {
    pub flash: &'a mut F,
    pub primary: FlashArea,
    pub secondary: FlashArea,
    pub scratch: Option<FlashArea>,
    pub primary_sectors: SectorMap,
    pub secondary_sectors: SectorMap,
    pub layout: TrailerLayout,
    pub image_index: u8,
    /// Cipher for the image occupying the primary slot at swap start.
    pub enc_primary: Option<EncInfo>,
    /// Cipher for the image occupying the secondary slot at swap start.
    pub enc_secondary: Option<EncInfo>,
    /// Data offset of the secondary image within its slot (offset policy).
    pub sec_data_off: u32,
    pub watchdog: &'a mut W,
}

impl<'a, F: Flash, W: Watchdog> SwapContext<'a, F, W> {
    pub fn slot_area(&self, slot: Slot) -> Result<FlashArea> {
        match slot {
            Slot::Primary => Ok(self.primary),
            Slot::Secondary => Ok(self.secondary),
            Slot::Scratch => self.scratch.ok_or(Error::BadState("no scratch area")),
        }
    }

    /// Swap size rounded up to whole write blocks.
    pub fn swap_limit(&self, bs: &BootStatus) -> u32 {
        align_up(bs.swap_size, self.layout.write_sz)
    }

    /// Streams `len` bytes between two slots, decrypting bytes leaving the
    /// secondary with `dec` and re-encrypting bytes entering it with `enc`.
    /// The second member of each pair is the image-relative offset of the
    /// region's first byte.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_region(
        &mut self,
        src: Slot,
        src_off: u32,
        dst: Slot,
        dst_off: u32,
        len: u32,
        dec: Option<(EncInfo, u32)>,
        enc: Option<(EncInfo, u32)>,
    ) -> Result<()> {
        let src_area = self.slot_area(src)?;
        let dst_area = self.slot_area(dst)?;
        let mut buf = [0u8; SCRATCH_BUF_SIZE];
        let mut done = 0u32;
        while done < len {
            let chunk = (len - done).min(SCRATCH_BUF_SIZE as u32);
            let slice = &mut buf[..chunk as usize];
            src_area.read(self.flash, src_off + done, slice)?;
            if let Some((info, base)) = &dec {
                info.transform(base + done, slice);
            }
            if let Some((info, base)) = &enc {
                info.transform(base + done, slice);
            }
            dst_area.write(self.flash, dst_off + done, slice)?;
            done += chunk;
        }
        self.watchdog.feed();
        Ok(())
    }

    /// Erases (or scrambles) the stale trailer state of `slot`, touching
    /// only trailer sectors that hold no swapped image data. A trailer
    /// sector shared with image data is the swap's own responsibility.
    pub fn scrub_trailer(&mut self, slot: Slot, swap_limit: u32) -> Result<()> {
        let area = self.slot_area(slot)?;
        let trailer_start = self.layout.status_off(&area, slot == Slot::Scratch);
        if self.flash.requires_erase() {
            let mut off = trailer_start;
            while off < area.size {
                let sector = area.sector_at(self.flash, off)?;
                if sector.off >= swap_limit
                    && !area.is_erased(self.flash, sector.off, sector.size)?
                {
                    area.erase(self.flash, sector.off, sector.size)?;
                }
                off = sector.end();
            }
        } else {
            let start = trailer_start.max(swap_limit);
            if !area.is_erased(self.flash, start, area.size - start)? {
                area.scramble(self.flash, start, area.size - start)?;
            }
        }
        Ok(())
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Total on-flash size of the image in `area`: header, payload and both TLV
/// regions.
pub fn image_total_size<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    header: &ImageHeader,
    data_off: u32,
) -> Result<u32> {
    let cursor = TlvCursor::begin(flash, area, header, data_off, crate::image::tlv::ANY, false)?;
    Ok(cursor.image_end(data_off))
}

/// Appends the status entry certifying sub-step `bs.op_count`, then
/// advances. Entries go to the scratch trailer while `bs.use_scratch`
/// holds (only ever the first three ops), to the primary otherwise.
pub fn write_status<F: Flash, W: Watchdog>(
    ctx: &mut SwapContext<'_, F, W>,
    bs: &mut BootStatus,
) -> Result<()> {
    let (area, is_scratch) = if bs.use_scratch {
        (ctx.slot_area(Slot::Scratch)?, true)
    } else {
        (ctx.primary, false)
    };
    let capacity = if is_scratch { 3 } else { 3 * MAX_IMAGE_SECTORS as u32 };
    if bs.op_count >= capacity {
        return Err(Error::BadState("status log overflow"));
    }
    let off = ctx.layout.status_off(&area, is_scratch) + bs.op_count * ctx.layout.write_sz;
    let mut buf = [0u8; MAX_WRITE_ALIGN];
    let len = ctx.layout.write_sz as usize;
    for byte in &mut buf[..len] {
        *byte = ctx.flash.erased_val();
    }
    buf[0] = (bs.op_count % 3) as u8 + 1;
    area.write(ctx.flash, off, &buf[..len])?;
    bs.op_count += 1;
    Ok(())
}

/// Counts the contiguous written entries of a status log.
pub fn read_status_count<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
    is_scratch: bool,
) -> Result<u32> {
    let base = layout.status_off(area, is_scratch);
    let max = if is_scratch { 3 } else { 3 * MAX_IMAGE_SECTORS as u32 };
    let erased = flash.erased_val();
    let mut count = 0;
    while count < max {
        let mut byte = [0u8; 1];
        area.read(flash, base + count * layout.write_sz, &mut byte)?;
        if byte[0] == erased {
            break;
        }
        count += 1;
    }
    Ok(count)
}

/// Replays the status entries `0..count` into a freshly rebuilt trailer.
pub fn replay_status<F: Flash, W: Watchdog>(
    ctx: &mut SwapContext<'_, F, W>,
    count: u32,
) -> Result<()> {
    let base = ctx.layout.status_off(&ctx.primary, false);
    let len = ctx.layout.write_sz as usize;
    for index in 0..count {
        let mut buf = [0u8; MAX_WRITE_ALIGN];
        for byte in &mut buf[..len] {
            *byte = ctx.flash.erased_val();
        }
        buf[0] = (index % 3) as u8 + 1;
        ctx.primary.write(ctx.flash, base + index * ctx.layout.write_sz, &buf[..len])?;
    }
    Ok(())
}

/// Initialises a trailer for an in-progress swap: swap_info, swap_size,
/// the unwrapped keys when images are encrypted, and the magic last, so a
/// reset before the magic leaves the trailer ignorable.
pub fn status_init<F: Flash, W: Watchdog>(
    ctx: &mut SwapContext<'_, F, W>,
    bs: &BootStatus,
    target: Slot,
) -> Result<()> {
    let area = ctx.slot_area(target)?;
    trailer::write_swap_info(ctx.flash, &area, &ctx.layout, bs.swap_type, ctx.image_index)?;
    trailer::write_swap_size(ctx.flash, &area, &ctx.layout, bs.swap_size)?;
    if ctx.layout.has_enc {
        if let Some(info) = &ctx.enc_primary {
            trailer::write_enc_key(ctx.flash, &area, &ctx.layout, 0, &info.cipher.field())?;
        }
        if let Some(info) = &ctx.enc_secondary {
            trailer::write_enc_key(ctx.flash, &area, &ctx.layout, 1, &info.cipher.field())?;
        }
    }
    trailer::write_magic(ctx.flash, &area, &ctx.layout)
}

/// Post-swap trailer finalisation. image_ok precedes copy_done so a reset
/// in between resumes (and completes) instead of scheduling a second
/// revert.
pub fn finalize<F: Flash, W: Watchdog>(
    ctx: &mut SwapContext<'_, F, W>,
    bs: &BootStatus,
) -> Result<()> {
    if matches!(bs.swap_type, SwapType::Perm | SwapType::Revert) {
        trailer::write_image_ok(ctx.flash, &ctx.primary, &ctx.layout)?;
    }
    trailer::write_copy_done(ctx.flash, &ctx.primary, &ctx.layout)
}

/// Locates an interrupted swap, if any, and reloads its progress.
///
/// Resume rules, in order: a GOOD scratch magic means the interrupted
/// operation was routing status through scratch; otherwise a GOOD primary
/// magic with an in-progress swap type and copy_done still unset means the
/// swap began but did not finish. Anything else is not a resume and the
/// decision table runs afresh.
pub fn load_status<F: Flash>(
    flash: &mut F,
    layout: &TrailerLayout,
    primary: &FlashArea,
    scratch: Option<&FlashArea>,
) -> Result<Option<BootStatus>> {
    if let Some(scratch) = scratch {
        let state = trailer::read_swap_state(flash, scratch, layout)?;
        if state.magic == trailer::MagicState::Good {
            if !state.swap_type.is_upgrade() {
                return Err(Error::BadState("scratch trailer names no swap"));
            }
            let op_count = read_status_count(flash, scratch, layout, true)?;
            let swap_size = trailer::read_swap_size(flash, scratch, layout)?;
            info!("resuming swap from scratch, op {=u32}", op_count);
            return Ok(Some(BootStatus {
                op_count,
                swap_type: state.swap_type,
                swap_size,
                source: StatusSource::Scratch,
                use_scratch: true,
            }));
        }
    }
    let state = trailer::read_swap_state(flash, primary, layout)?;
    if state.magic == trailer::MagicState::Good
        && state.swap_type.is_upgrade()
        && state.copy_done == trailer::FlagState::Unset
    {
        let op_count = read_status_count(flash, primary, layout, false)?;
        let swap_size = trailer::read_swap_size(flash, primary, layout)?;
        info!("resuming swap from primary trailer, op {=u32}", op_count);
        return Ok(Some(BootStatus {
            op_count,
            swap_type: state.swap_type,
            swap_size,
            source: StatusSource::Primary,
            use_scratch: false,
        }));
    }
    Ok(None)
}

/// A span of whole sectors, common to both slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub off: u32,
    /// Sector-bounded end.
    pub end: u32,
    /// Image bytes within the span (the tail of the last chunk may be
    /// trailer territory and is not copied).
    pub data_len: u32,
}

/// Splits `[0, swap_limit)` at boundaries shared by both sector maps.
/// Fails when a shared boundary cannot be reached within `max_span` bytes
/// (the scratch capacity): the slots are not compatible.
pub fn build_chunks(
    primary: &SectorMap,
    secondary: &SectorMap,
    swap_limit: u32,
    max_span: u32,
    out: &mut [Chunk; MAX_IMAGE_SECTORS],
) -> Result<usize> {
    let mut count = 0;
    let mut off = 0u32;
    while off < swap_limit {
        let end = next_common_boundary(primary, secondary, off)
            .ok_or(Error::BadState("slot sector layouts never align"))?;
        if end - off > max_span {
            return Err(Error::BadState("sector group exceeds scratch capacity"));
        }
        if count == MAX_IMAGE_SECTORS {
            return Err(Error::BadState("too many swap chunks"));
        }
        out[count] = Chunk { off, end, data_len: swap_limit.min(end) - off };
        count += 1;
        off = end;
    }
    Ok(count)
}

fn next_common_boundary(primary: &SectorMap, secondary: &SectorMap, from: u32) -> Option<u32> {
    let mut candidate = primary
        .containing(from)?
        .1
        .end()
        .max(secondary.containing(from)?.1.end());
    loop {
        let pri_end = primary.containing(candidate - 1)?.1.end();
        let sec_end = secondary.containing(candidate - 1)?.1.end();
        let both = pri_end.max(sec_end);
        if both == candidate {
            return Some(candidate);
        }
        candidate = both;
    }
}

/// Where each image's header currently lives, given recorded progress.
/// Needed to rebuild cipher geometry when resuming an encrypted swap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeaderLocations {
    /// Header of the image that occupied the primary slot at swap start.
    pub from_primary: (Slot, u32),
    /// Header of the image that occupied the secondary slot at swap start.
    pub from_secondary: (Slot, u32),
}

/// Derives header locations from the op count. `units` is the strategy's
/// sector (or chunk) count over the swap range; `sector_size` the uniform
/// sector size for the slide and offset strategies.
pub fn header_locations(
    policy: SwapPolicy,
    swap_type: SwapType,
    ops: u32,
    units: u32,
    sector_size: u32,
) -> HeaderLocations {
    let n = units;
    match policy {
        SwapPolicy::Scratch => {
            // chunks run last-to-first; the chunk holding sector 0 is last
            let base = 3 * (n - 1);
            let from_secondary = if ops >= base + 3 {
                (Slot::Primary, 0)
            } else if ops >= base + 1 {
                (Slot::Scratch, 0)
            } else {
                (Slot::Secondary, 0)
            };
            let from_primary =
                if ops >= base + 2 { (Slot::Secondary, 0) } else { (Slot::Primary, 0) };
            HeaderLocations { from_primary, from_secondary }
        }
        SwapPolicy::Slide => {
            let from_primary = if ops >= n + 2 {
                (Slot::Secondary, 0)
            } else if ops >= n {
                (Slot::Primary, sector_size)
            } else {
                (Slot::Primary, 0)
            };
            let from_secondary =
                if ops >= n + 1 { (Slot::Primary, 0) } else { (Slot::Secondary, 0) };
            HeaderLocations { from_primary, from_secondary }
        }
        SwapPolicy::Offset => {
            if swap_type == SwapType::Revert {
                // descending walk; sector 0 exchanged by the final two ops
                let from_primary = if ops >= 2 * n - 1 {
                    (Slot::Secondary, sector_size)
                } else {
                    (Slot::Primary, 0)
                };
                let from_secondary =
                    if ops >= 2 * n { (Slot::Primary, 0) } else { (Slot::Secondary, 0) };
                HeaderLocations { from_primary, from_secondary }
            } else {
                let from_primary =
                    if ops >= 1 { (Slot::Secondary, 0) } else { (Slot::Primary, 0) };
                let from_secondary = if ops >= 2 {
                    (Slot::Primary, 0)
                } else {
                    (Slot::Secondary, sector_size)
                };
                HeaderLocations { from_primary, from_secondary }
            }
        }
        SwapPolicy::Overwrite => HeaderLocations {
            from_primary: (Slot::Primary, 0),
            from_secondary: (Slot::Secondary, 0),
        },
    }
}

/// Largest image (header + payload + TLVs) each strategy can accept.
pub fn max_image_size(
    policy: SwapPolicy,
    layout: &TrailerLayout,
    primary: &FlashArea,
    secondary: &FlashArea,
    primary_sectors: &SectorMap,
    secondary_sectors: &SectorMap,
) -> u32 {
    let pri_status = layout.status_off(primary, false);
    let sec_status = layout.status_off(secondary, false);
    let trailer_sector_start = |sectors: &SectorMap, status: u32| {
        sectors.containing(status).map(|(_, s)| s.off).unwrap_or(status)
    };
    match policy {
        SwapPolicy::Scratch => pri_status.min(sec_status),
        SwapPolicy::Slide => {
            let s = primary_sectors.get(0).size;
            let pri = trailer_sector_start(primary_sectors, pri_status).saturating_sub(s);
            pri.min(trailer_sector_start(secondary_sectors, sec_status))
        }
        SwapPolicy::Offset => {
            let s = secondary_sectors.get(0).size;
            let sec = trailer_sector_start(secondary_sectors, sec_status).saturating_sub(s);
            sec.min(trailer_sector_start(primary_sectors, pri_status))
        }
        SwapPolicy::Overwrite => {
            layout.swap_info_off(primary).min(layout.swap_info_off(secondary))
        }
    }
}

/// Runs (or resumes) the selected strategy over one prepared context.
pub fn execute<F: Flash, W: Watchdog>(
    policy: SwapPolicy,
    ctx: &mut SwapContext<'_, F, W>,
    bs: &mut BootStatus,
) -> Result<()> {
    match policy {
        SwapPolicy::Scratch => scratch::run(ctx, bs),
        SwapPolicy::Slide => slide::run(ctx, bs),
        SwapPolicy::Offset => offset::run(ctx, bs),
        SwapPolicy::Overwrite => overwrite::run(ctx, bs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::AreaId;
    use crate::hal::doubles::flash::FakeFlash;

    fn map(flash: &FakeFlash, off: u32, size: u32) -> SectorMap {
        SectorMap::of_area(flash, &FlashArea { id: AreaId::primary(0), off, size }).unwrap()
    }

    #[test]
    fn chunks_split_at_shared_boundaries() {
        // primary: 4 x 0x400; secondary: 2 x 0x800 over the same span
        let flash = FakeFlash::new(&[(4, 0x400), (2, 0x800)], 8);
        let primary = map(&flash, 0, 0x1000);
        let secondary = map(&flash, 0x1000, 0x1000);
        let mut chunks = [Chunk { off: 0, end: 0, data_len: 0 }; MAX_IMAGE_SECTORS];
        let count = build_chunks(&primary, &secondary, 0x1000, 0x800, &mut chunks).unwrap();
        assert_eq!(count, 2);
        assert_eq!(chunks[0], Chunk { off: 0, end: 0x800, data_len: 0x800 });
        assert_eq!(chunks[1], Chunk { off: 0x800, end: 0x1000, data_len: 0x800 });
    }

    #[test]
    fn chunk_tail_clips_to_the_swap_limit() {
        let flash = FakeFlash::new(&[(8, 0x400)], 8);
        let primary = map(&flash, 0, 0x1000);
        let secondary = map(&flash, 0x1000, 0x1000);
        let mut chunks = [Chunk { off: 0, end: 0, data_len: 0 }; MAX_IMAGE_SECTORS];
        let count = build_chunks(&primary, &secondary, 0x500, 0x400, &mut chunks).unwrap();
        assert_eq!(count, 2);
        assert_eq!(chunks[1], Chunk { off: 0x400, end: 0x800, data_len: 0x100 });
    }

    #[test]
    fn incompatible_layouts_are_refused() {
        let flash = FakeFlash::new(&[(4, 0x400), (2, 0x800)], 8);
        let primary = map(&flash, 0, 0x1000);
        let secondary = map(&flash, 0x1000, 0x1000);
        let mut chunks = [Chunk { off: 0, end: 0, data_len: 0 }; MAX_IMAGE_SECTORS];
        // scratch smaller than the only shared grouping
        assert!(build_chunks(&primary, &secondary, 0x1000, 0x400, &mut chunks).is_err());
    }

    #[test]
    fn status_progress_record_maps_to_idx_and_state() {
        let mut bs = BootStatus::fresh(SwapType::Test, 0x1000);
        assert!(bs.is_reset());
        bs.op_count = 7;
        bs.source = StatusSource::Primary;
        assert!(!bs.is_reset());
        assert_eq!(bs.idx(), 2);
        assert_eq!(bs.state(), 1);
    }

    #[test]
    fn header_locations_track_slide_progress() {
        let n = 4;
        let s = 0x400;
        let at = |ops| header_locations(SwapPolicy::Slide, SwapType::Test, ops, n, s);
        assert_eq!(at(0).from_primary, (Slot::Primary, 0));
        assert_eq!(at(n).from_primary, (Slot::Primary, s));
        assert_eq!(at(n + 2).from_primary, (Slot::Secondary, 0));
        assert_eq!(at(n).from_secondary, (Slot::Secondary, 0));
        assert_eq!(at(n + 1).from_secondary, (Slot::Primary, 0));
    }

    #[test]
    fn header_locations_track_offset_upgrade_and_revert() {
        let at = |ty, ops| header_locations(SwapPolicy::Offset, ty, ops, 4, 0x400);
        assert_eq!(at(SwapType::Test, 0).from_secondary, (Slot::Secondary, 0x400));
        assert_eq!(at(SwapType::Test, 2).from_secondary, (Slot::Primary, 0));
        assert_eq!(at(SwapType::Revert, 0).from_secondary, (Slot::Secondary, 0));
        assert_eq!(at(SwapType::Revert, 8).from_secondary, (Slot::Primary, 0));
        assert_eq!(at(SwapType::Revert, 7).from_primary, (Slot::Secondary, 0x400));
    }
}
