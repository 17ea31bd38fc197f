//! Swap through a dedicated scratch area.
//!
//! Sector groups are exchanged from the top of the image range downwards,
//! three sub-steps per group: save the secondary's group to scratch, move
//! the primary's group into the secondary, pull the saved group into the
//! primary. The group containing the primary trailer goes first; for its
//! duration the status log and swap metadata live in the scratch trailer,
//! and the step that rewrites the primary's trailer sector also rebuilds
//! the trailer and replays the log before scratch is wiped.

use super::trailer::MagicState;
use super::{
    build_chunks, replay_status, status_init, trailer, write_status, BootStatus, Chunk,
    SwapContext, Slot, StatusSource,
};
use crate::config::MAX_IMAGE_SECTORS;
use crate::error::{Error, Result};
use crate::hal::flash::Flash;
use crate::hal::watchdog::Watchdog;

pub fn run<F: Flash, W: Watchdog>(
    ctx: &mut SwapContext<'_, F, W>,
    bs: &mut BootStatus,
) -> Result<()> {
    let scratch = ctx.slot_area(Slot::Scratch)?;
    let swap_limit = ctx.swap_limit(bs);
    let scratch_cap = ctx.layout.status_off(&scratch, true);

    let mut chunks = [Chunk { off: 0, end: 0, data_len: 0 }; MAX_IMAGE_SECTORS];
    let count =
        build_chunks(&ctx.primary_sectors, &ctx.secondary_sectors, swap_limit, scratch_cap, &mut chunks)?;
    if count == 0 {
        return Err(Error::BadState("empty swap range"));
    }

    let status_off = ctx.layout.status_off(&ctx.primary, false);
    let trailer_sector_start = ctx
        .primary_sectors
        .containing(status_off)
        .ok_or(Error::BadState("trailer outside sector map"))?
        .1
        .off;
    let trailer_in_range = chunks[count - 1].end > trailer_sector_start;

    if bs.is_reset() {
        ctx.scrub_trailer(Slot::Primary, swap_limit)?;
        if trailer_in_range {
            // the status log starts life in scratch; nothing anchors the
            // swap until the first group's save step commits
            bs.use_scratch = true;
            bs.source = StatusSource::Scratch;
        } else {
            status_init(ctx, bs, Slot::Primary)?;
            bs.source = StatusSource::Primary;
        }
    } else {
        bs.use_scratch = bs.source == StatusSource::Scratch;
    }
    ctx.scrub_trailer(Slot::Secondary, swap_limit)?;

    for position in 0..count as u32 {
        let chunk = chunks[count - 1 - position as usize];
        let base = 3 * position;
        let in_trailer_group = trailer_in_range && position == 0;

        if bs.op_count == base {
            scratch.erase(ctx.flash, 0, scratch.size)?;
            let dec = None;
            ctx.copy_region(Slot::Secondary, chunk.off, Slot::Scratch, 0, chunk.data_len, dec, None)?;
            if in_trailer_group {
                status_init(ctx, bs, Slot::Scratch)?;
            }
            write_status(ctx, bs)?;
        }

        if bs.op_count == base + 1 {
            ctx.secondary.erase_region(ctx.flash, chunk.off, chunk.end - chunk.off)?;
            let enc = ctx.enc_primary.map(|info| (info, chunk.off));
            ctx.copy_region(Slot::Primary, chunk.off, Slot::Secondary, chunk.off, chunk.data_len, None, enc)?;
            write_status(ctx, bs)?;
        }

        if bs.op_count == base + 2 {
            ctx.primary.erase_region(ctx.flash, chunk.off, chunk.end - chunk.off)?;
            let dec = ctx.enc_secondary.map(|info| (info, chunk.off));
            ctx.copy_region(Slot::Scratch, 0, Slot::Primary, chunk.off, chunk.data_len, dec, None)?;
            if in_trailer_group {
                // the erase above took the trailer sector with it; rebuild
                // it, account for this step in the replayed log, then
                // release scratch as the status source
                bs.op_count = base + 3;
                bs.use_scratch = false;
                bs.source = StatusSource::Primary;
                status_init(ctx, bs, Slot::Primary)?;
                replay_status(ctx, bs.op_count)?;
                scratch.erase(ctx.flash, 0, scratch.size)?;
            } else {
                write_status(ctx, bs)?;
            }
        }
    }
    Ok(())
}

/// True when the scratch area still claims an in-flight step.
pub fn scratch_active<F: Flash>(
    flash: &mut F,
    layout: &trailer::TrailerLayout,
    scratch: &crate::area::FlashArea,
) -> Result<bool> {
    Ok(trailer::read_swap_state(flash, scratch, layout)?.magic == MagicState::Good)
}
