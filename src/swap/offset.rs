//! Swap against a secondary stored one sector up.
//!
//! Sector 0 of the secondary slot holds bookkeeping, so the upgrade image
//! begins at sector 1 and the exchange needs no scratch: walking upwards,
//! the old primary sector drops into the just-freed secondary sector below
//! it, and the next new sector drops into the primary. After an upgrade the
//! displaced image sits at secondary offset zero; the revert walks
//! downwards and restores the one-sector layout.

use super::{status_init, write_status, BootStatus, Slot, StatusSource, SwapContext};
use super::trailer::SwapType;
use crate::area::SectorMap;
use crate::error::{Error, Result};
use crate::hal::flash::Flash;
use crate::hal::watchdog::Watchdog;

fn check_uniform(map: &SectorMap, sectors: u32, size: u32) -> Result<()> {
    for i in 0..sectors as usize {
        if i >= map.len() || map.get(i).size != size {
            return Err(Error::BadState("offset swap needs equal sector sizes"));
        }
    }
    Ok(())
}

pub fn run<F: Flash, W: Watchdog>(
    ctx: &mut SwapContext<'_, F, W>,
    bs: &mut BootStatus,
) -> Result<()> {
    let swap_limit = ctx.swap_limit(bs);
    let sector = ctx.secondary_sectors.get(0).size;
    let n = swap_limit.div_ceil(sector);
    if n == 0 {
        return Err(Error::BadState("empty swap range"));
    }
    check_uniform(&ctx.primary_sectors, n, sector)?;
    check_uniform(&ctx.secondary_sectors, n + 1, sector)?;

    let pri_status = ctx.layout.status_off(&ctx.primary, false);
    let sec_status = ctx.layout.status_off(&ctx.secondary, false);
    let pri_limit = ctx
        .primary_sectors
        .containing(pri_status)
        .ok_or(Error::BadState("trailer outside sector map"))?
        .1
        .off;
    let sec_limit = ctx
        .secondary_sectors
        .containing(sec_status)
        .ok_or(Error::BadState("trailer outside sector map"))?
        .1
        .off;
    if n * sector > pri_limit || (n + 1) * sector > sec_limit {
        return Err(Error::BadState("image collides with the trailer"));
    }

    if bs.is_reset() {
        ctx.scrub_trailer(Slot::Primary, swap_limit)?;
        status_init(ctx, bs, Slot::Primary)?;
        bs.source = StatusSource::Primary;
    }
    ctx.scrub_trailer(Slot::Secondary, (n + 1) * sector)?;

    let clip = |i: u32| sector.min(swap_limit - i * sector);

    if bs.swap_type == SwapType::Revert {
        // downwards: re-shift the image under test back up by one sector
        // and restore the previous image below it
        for k in 0..n {
            let i = n - 1 - k;
            if bs.op_count == 2 * k {
                ctx.secondary.erase_region(ctx.flash, (i + 1) * sector, sector)?;
                let enc = ctx.enc_primary.map(|info| (info, i * sector));
                ctx.copy_region(
                    Slot::Primary,
                    i * sector,
                    Slot::Secondary,
                    (i + 1) * sector,
                    clip(i),
                    None,
                    enc,
                )?;
                write_status(ctx, bs)?;
            }
            if bs.op_count == 2 * k + 1 {
                ctx.primary.erase_region(ctx.flash, i * sector, sector)?;
                let dec = ctx.enc_secondary.map(|info| (info, i * sector));
                ctx.copy_region(
                    Slot::Secondary,
                    i * sector,
                    Slot::Primary,
                    i * sector,
                    clip(i),
                    dec,
                    None,
                )?;
                write_status(ctx, bs)?;
            }
        }
    } else {
        for i in 0..n {
            if bs.op_count == 2 * i {
                ctx.secondary.erase_region(ctx.flash, i * sector, sector)?;
                let enc = ctx.enc_primary.map(|info| (info, i * sector));
                ctx.copy_region(
                    Slot::Primary,
                    i * sector,
                    Slot::Secondary,
                    i * sector,
                    clip(i),
                    None,
                    enc,
                )?;
                write_status(ctx, bs)?;
            }
            if bs.op_count == 2 * i + 1 {
                ctx.primary.erase_region(ctx.flash, i * sector, sector)?;
                let dec = ctx.enc_secondary.map(|info| (info, i * sector));
                ctx.copy_region(
                    Slot::Secondary,
                    (i + 1) * sector,
                    Slot::Primary,
                    i * sector,
                    clip(i),
                    dec,
                    None,
                )?;
                write_status(ctx, bs)?;
            }
        }
    }
    Ok(())
}
