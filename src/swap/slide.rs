//! Swap by sliding the primary one sector up, then interleaving.
//!
//! Needs no scratch, but requires identical sector sizes and one spare
//! sector below the primary trailer. Phase one shifts primary[i] into
//! primary[i+1] from the top down; phase two walks upwards pulling
//! secondary[i] into the vacated primary[i] and parking the displaced
//! primary sector (now at i+1) into secondary[i].

use super::{status_init, write_status, BootStatus, Slot, StatusSource, SwapContext};
use crate::area::SectorMap;
use crate::error::{Error, Result};
use crate::hal::flash::Flash;
use crate::hal::watchdog::Watchdog;

fn check_uniform(map: &SectorMap, sectors: u32, size: u32) -> Result<()> {
    for i in 0..sectors as usize {
        if i >= map.len() || map.get(i).size != size {
            return Err(Error::BadState("move swap needs equal sector sizes"));
        }
    }
    Ok(())
}

pub fn run<F: Flash, W: Watchdog>(
    ctx: &mut SwapContext<'_, F, W>,
    bs: &mut BootStatus,
) -> Result<()> {
    let swap_limit = ctx.swap_limit(bs);
    let sector = ctx.primary_sectors.get(0).size;
    let n = swap_limit.div_ceil(sector);
    if n == 0 {
        return Err(Error::BadState("empty swap range"));
    }
    check_uniform(&ctx.primary_sectors, n + 1, sector)?;
    check_uniform(&ctx.secondary_sectors, n, sector)?;

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
    if (n + 1) * sector > pri_limit || n * sector > sec_limit {
        return Err(Error::BadState("image collides with the trailer"));
    }

    if bs.is_reset() {
        ctx.scrub_trailer(Slot::Primary, (n + 1) * sector)?;
        status_init(ctx, bs, Slot::Primary)?;
        bs.source = StatusSource::Primary;
    }
    ctx.scrub_trailer(Slot::Secondary, swap_limit)?;

    let clip = |i: u32| sector.min(swap_limit - i * sector);

    // phase one: shift the primary up, top sector first
    for op in 0..n {
        if bs.op_count == op {
            let i = n - 1 - op;
            ctx.primary.erase_region(ctx.flash, (i + 1) * sector, sector)?;
            ctx.copy_region(
                Slot::Primary,
                i * sector,
                Slot::Primary,
                (i + 1) * sector,
                clip(i),
                None,
                None,
            )?;
            write_status(ctx, bs)?;
        }
    }

    // phase two: exchange upwards
    for i in 0..n {
        if bs.op_count == n + 2 * i {
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
        if bs.op_count == n + 2 * i + 1 {
            ctx.secondary.erase_region(ctx.flash, i * sector, sector)?;
            let enc = ctx.enc_primary.map(|info| (info, i * sector));
            ctx.copy_region(
                Slot::Primary,
                (i + 1) * sector,
                Slot::Secondary,
                i * sector,
                clip(i),
                None,
                enc,
            )?;
            write_status(ctx, bs)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::Fixture;
    use super::*;
    use crate::enc::ImageCipher;
    use crate::image::AesKind;
    use crate::swap::trailer::SwapType;
    use crate::swap::{finalize, load_status, EncInfo, SwapPolicy};

    #[test]
    fn full_swap_exchanges_both_images() {
        let mut fx = Fixture::new(SwapPolicy::Slide);
        let (old, new) = fx.install_pair(0x1700, 0x1f40);
        let mut bs = fx.fresh_status(SwapType::Test);
        let mut ctx = fx.context();
        run(&mut ctx, &mut bs).unwrap();
        finalize(&mut ctx, &bs).unwrap();
        fx.assert_primary_holds(&new);
        fx.assert_secondary_holds(&old);
    }

    #[test]
    fn power_cut_at_every_op_converges() {
        let mut reference = Fixture::new(SwapPolicy::Slide);
        let (old, new) = reference.install_pair(0x1700, 0x1f40);

        let mut baseline = reference.clone();
        let mut bs = baseline.fresh_status(SwapType::Test);
        let mut ctx = baseline.context();
        run(&mut ctx, &mut bs).unwrap();
        finalize(&mut ctx, &bs).unwrap();
        let total_ops = baseline.flash.ops;

        for cut in 0..total_ops {
            let mut fx = reference.clone();
            fx.flash.set_budget(Some(cut));
            let mut bs = fx.fresh_status(SwapType::Test);
            let mut ctx = fx.context();
            let _ = run(&mut ctx, &mut bs).and_then(|_| finalize(&mut ctx, &bs));
            fx.flash.set_budget(None);

            let resumed =
                load_status(&mut fx.flash, &fx.layout, &fx.primary, None).unwrap();
            let mut bs = match resumed {
                Some(bs) => bs,
                None => fx.fresh_status(SwapType::Test),
            };
            let mut ctx = fx.context();
            run(&mut ctx, &mut bs).unwrap();
            finalize(&mut ctx, &bs).unwrap();
            fx.assert_primary_holds(&new);
            fx.assert_secondary_holds(&old);
        }
    }

    #[test]
    fn resume_mid_swap_picks_up_at_the_recorded_op() {
        // cut between a sector write and its status entry: the engine must
        // replay that sector and complete (power-cut scenario for the
        // mid-swap reset)
        let mut fx = Fixture::new(SwapPolicy::Slide);
        let (old, new) = fx.install_pair(0x1700, 0x1f40);
        {
            let mut bs = fx.fresh_status(SwapType::Test);
            let mut ctx = fx.context();
            // magic + info + size + 2 keys = 5 trailer writes, then ops
            ctx.flash.set_budget(Some(30));
            let _ = run(&mut ctx, &mut bs);
        }
        fx.flash.set_budget(None);
        let mut bs = load_status(&mut fx.flash, &fx.layout, &fx.primary, None)
            .unwrap()
            .expect("swap must be resumable");
        assert!(bs.op_count > 0);
        let mut ctx = fx.context();
        run(&mut ctx, &mut bs).unwrap();
        finalize(&mut ctx, &bs).unwrap();
        fx.assert_primary_holds(&new);
        fx.assert_secondary_holds(&old);
    }

    #[test]
    fn encrypted_images_transform_as_they_travel() {
        let mut fx = Fixture::new(SwapPolicy::Slide);

        // build plaintext "images": 32-byte header then payload
        let old_plain: Vec<u8> = (0..0x900u32).map(|i| (i % 241) as u8).collect();
        let new_plain: Vec<u8> = (0..0xd00u32).map(|i| (i % 199) as u8).collect();
        let old_cipher = ImageCipher::new(&[0xaa; 16], AesKind::Aes128);
        let new_cipher = ImageCipher::new(&[0xbb; 16], AesKind::Aes128);

        // the secondary holds the new image encrypted; the primary is
        // plaintext at rest
        let mut new_sealed = new_plain.clone();
        new_cipher.encrypt(0, &mut new_sealed[32..]);
        fx.flash.install(fx.primary.off, &old_plain);
        fx.flash.install(fx.secondary.off, &new_sealed);
        fx.swap_size = new_sealed.len() as u32;
        fx.enc_primary = Some(EncInfo {
            cipher: old_cipher,
            hdr_size: 32,
            img_size: old_plain.len() as u32 - 32,
        });
        fx.enc_secondary = Some(EncInfo {
            cipher: new_cipher,
            hdr_size: 32,
            img_size: new_plain.len() as u32 - 32,
        });

        let mut bs = fx.fresh_status(SwapType::Test);
        let mut ctx = fx.context();
        run(&mut ctx, &mut bs).unwrap();
        finalize(&mut ctx, &bs).unwrap();

        // primary now holds the new image decrypted
        fx.assert_primary_holds(&new_plain);
        // secondary holds the old image re-encrypted with its own key
        let mut old_sealed = old_plain.clone();
        old_cipher.encrypt(0, &mut old_sealed[32..]);
        fx.assert_secondary_holds(&old_sealed);
    }

    #[test]
    fn oversized_image_is_refused() {
        let mut fx = Fixture::new(SwapPolicy::Slide);
        let limit = fx.layout.status_off(&fx.primary, false);
        let (_, _) = fx.install_pair(0x400, limit);
        let mut bs = fx.fresh_status(SwapType::Test);
        let mut ctx = fx.context();
        assert!(run(&mut ctx, &mut bs).is_err());
    }
}
