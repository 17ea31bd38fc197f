//! The boot driver.
//!
//! `go` opens every configured area, reads headers and trailer state, runs
//! the validator over each candidate, consults the decision table, drives
//! the swap engine (resume branch first), revalidates the primary, writes
//! the shared boot information, and returns the entry point of the primary
//! slot. Construction is the port's job: the port owns the flash driver,
//! the key material and the geometry.

use crate::area::{AreaId, FlashArea, FlashMap, SectorMap};
use crate::config;
use crate::enc::{self, ImageCipher, UnwrapKind, WRAPPED_MAX};
use crate::error::{Error, Result};
use crate::hal::counter::SecurityCounter;
use crate::hal::flash::Flash;
use crate::hal::watchdog::Watchdog;
use crate::image::signature::SignatureKind;
use crate::image::tlv::TlvCursor;
use crate::image::validate::{read_security_counter, validate_image, ValidationContext};
use crate::image::ImageHeader;
use crate::keys::{EncPrivateKey, KeyStore};
use crate::shared_data::{self, BootInfo};
use crate::swap::trailer::{
    self, FlagState, MagicState, SwapState, SwapType, TrailerLayout,
};
use crate::swap::{
    self, decision, BootStatus, EncInfo, Slot, StatusSource, SwapContext, SwapPolicy,
};

/// What the first-stage startup code needs to jump.
#[derive(Copy, Clone, Debug)]
pub struct BootResponse {
    /// Area the image runs from.
    pub area_id: AreaId,
    /// Device offset of the image start.
    pub image_off: u32,
    pub header: ImageHeader,
}

/// The boot driver over one flash device.
pub struct Bootloader<'a, F: Flash, SC: SecurityCounter, W: Watchdog> {
    pub flash: &'a mut F,
    pub map: FlashMap,
    pub keys: KeyStore<'a>,
    /// Device private key for encrypted images.
    pub enc_key: Option<EncPrivateKey<'a>>,
    /// Anti-rollback hardware, when the platform has it.
    pub counter: Option<&'a mut SC>,
    pub watchdog: &'a mut W,
    pub policy: SwapPolicy,
    pub sig: SignatureKind,
    pub unwrap: UnwrapKind,
    /// RAM region for the shared boot-information blob.
    pub shared_out: Option<&'a mut [u8]>,
}

const EMPTY_STATE: SwapState = SwapState {
    magic: MagicState::Unset,
    swap_type: SwapType::None,
    image_num: 0,
    copy_done: FlagState::Unset,
    image_ok: FlagState::Unset,
};

fn read_state_or_empty<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
) -> SwapState {
    trailer::read_swap_state(flash, area, layout).unwrap_or(EMPTY_STATE)
}

/// Unwraps the image key named by the wrapped-key TLV, when the header says
/// the image is encrypted. Shared with the recovery handler's post-upload
/// hook.
pub(crate) fn load_cipher<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    header: &ImageHeader,
    data_off: u32,
    unwrap: UnwrapKind,
    private: &Option<EncPrivateKey<'_>>,
) -> Result<Option<ImageCipher>> {
    let Some(aes) = header.encryption() else {
        return Ok(None);
    };
    let Some(private) = private else {
        debug!("encrypted image but no device decryption key");
        return Err(Error::BadImage);
    };
    let mut cursor =
        TlvCursor::begin(flash, area, header, data_off, unwrap.tlv_kind(), false)?;
    let Some(entry) = cursor.next(flash, area)? else {
        return Err(Error::BadImage);
    };
    if usize::from(entry.len) != unwrap.wrapped_len(aes) {
        return Err(Error::BadImage);
    }
    let mut wrapped = [0u8; WRAPPED_MAX];
    let wrapped = &mut wrapped[..usize::from(entry.len)];
    area.read(flash, entry.off, wrapped)?;
    Ok(Some(enc::unwrap_key(unwrap, private, wrapped, aes)?))
}

/// `boot_set_next` semantics shared by the pending and confirmed helpers.
fn set_next<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    layout: &TrailerLayout,
    image: u8,
    active: bool,
    confirm: bool,
) -> Result<()> {
    let confirm = confirm || active;
    let state = trailer::read_swap_state(flash, area, layout)?;
    match state.magic {
        MagicState::Good => {
            // a request is already scheduled; an active slot may still need
            // its confirmation. copy_done is deliberately not consulted so
            // a padded image installed by a programmer can be confirmed.
            if active && state.image_ok == FlagState::Unset {
                trailer::write_image_ok(flash, area, layout)?;
            }
            Ok(())
        }
        MagicState::Unset => {
            if !active {
                trailer::write_magic(flash, area, layout)?;
                if confirm {
                    trailer::write_image_ok(flash, area, layout)?;
                }
                let swap_type = if confirm { SwapType::Perm } else { SwapType::Test };
                trailer::write_swap_info(flash, area, layout, swap_type, image)?;
            }
            Ok(())
        }
        MagicState::Bad => {
            if active {
                Err(Error::BadState("running slot trailer is corrupt"))
            } else {
                // no way to decode the slot; erase it so future upgrades
                // have somewhere to land
                area.erase(flash, 0, area.size)?;
                Err(Error::BadImage)
            }
        }
    }
}

/// Marks the secondary image of `image` pending: installed on the next
/// boot, once (test) or permanently.
pub fn set_pending<F: Flash>(
    flash: &mut F,
    map: &FlashMap,
    image: u8,
    permanent: bool,
) -> Result<()> {
    let area = map.open(AreaId::secondary(image))?;
    let layout = TrailerLayout::new(flash, false);
    set_next(flash, &area, &layout, image, false, permanent)
}

/// Confirms the currently running image of `image`, preventing the next
/// boot from reverting it.
pub fn set_confirmed<F: Flash>(flash: &mut F, map: &FlashMap, image: u8) -> Result<()> {
    let area = map.open(AreaId::primary(image))?;
    let layout = TrailerLayout::new(flash, false);
    set_next(flash, &area, &layout, image, true, true)
}

/// What the next reboot will do for `image`, from trailer state alone.
pub fn swap_type<F: Flash>(flash: &mut F, map: &FlashMap, image: u8) -> Result<SwapType> {
    let layout = TrailerLayout::new(flash, false);
    let primary = map.open(AreaId::primary(image))?;
    let secondary = map.open(AreaId::secondary(image))?;
    let pri_state = trailer::read_swap_state(flash, &primary, &layout)?;
    let sec_state = read_state_or_empty(flash, &secondary, &layout);
    Ok(decision::swap_type(&pri_state, &sec_state))
}

impl<'a, F: Flash, SC: SecurityCounter, W: Watchdog> Bootloader<'a, F, SC, W> {
    fn layout(&self) -> TrailerLayout {
        TrailerLayout::new(self.flash, self.enc_key.is_some())
    }

    fn scratch_area(&self) -> Option<FlashArea> {
        if self.policy == SwapPolicy::Scratch {
            self.map.scratch()
        } else {
            None
        }
    }

    /// Data offset of the secondary image within its slot.
    fn sec_data_off(&self, sectors: &SectorMap, reverting: bool) -> u32 {
        if self.policy == SwapPolicy::Offset && !reverting {
            sectors.get(0).size
        } else {
            0
        }
    }

    /// Main boot decision. Returns where to jump, or an error when no
    /// authentic primary image exists (the caller typically halts).
    pub fn go(&mut self) -> Result<BootResponse> {
        for image in 0..self.map.image_count {
            self.process_image(image)?;
        }

        let mut response = None;
        let mut max_sizes = [0u32; config::MAX_IMAGES];
        for image in 0..self.map.image_count {
            let header = self.validate_primary(image)?;
            let primary = self.map.open(AreaId::primary(image))?;
            max_sizes[image as usize] = self.max_size_for(image)?;
            if image == 0 {
                response = Some(BootResponse {
                    area_id: primary.id,
                    image_off: primary.off,
                    header,
                });
            }
        }

        if let Some(out) = self.shared_out.take() {
            let info = BootInfo {
                mode: match self.policy {
                    SwapPolicy::Scratch => 1,
                    SwapPolicy::Slide => 2,
                    SwapPolicy::Offset => 3,
                    SwapPolicy::Overwrite => 4,
                },
                signature_kind: match self.sig {
                    SignatureKind::EcdsaP256 => 1,
                    SignatureKind::Rsa2048Pss | SignatureKind::Rsa3072Pss => 2,
                    SignatureKind::Ed25519 | SignatureKind::Ed25519Pure => 3,
                },
                recovery_kind: 1,
                running_slot: 0,
                bootloader_version: env!("CARGO_PKG_VERSION"),
                max_app_sizes: &max_sizes[..self.map.image_count as usize],
            };
            shared_data::publish(out, &info)?;
        }

        response.ok_or(Error::BadState("no images configured"))
    }

    fn max_size_for(&mut self, image: u8) -> Result<u32> {
        let layout = self.layout();
        let primary = self.map.open(AreaId::primary(image))?;
        let secondary = self.map.open(AreaId::secondary(image))?;
        let pri_sectors = SectorMap::of_area(self.flash, &primary)?;
        let sec_sectors = SectorMap::of_area(self.flash, &secondary)?;
        Ok(swap::max_image_size(
            self.policy,
            &layout,
            &primary,
            &secondary,
            &pri_sectors,
            &sec_sectors,
        ))
    }

    fn process_image(&mut self, image: u8) -> Result<()> {
        let layout = self.layout();
        let primary = self.map.open(AreaId::primary(image))?;
        let secondary = self.map.open(AreaId::secondary(image))?;
        let scratch = self.scratch_area();

        if self.policy != SwapPolicy::Overwrite {
            if let Some(mut bs) =
                swap::load_status(self.flash, &layout, &primary, scratch.as_ref())?
            {
                return self.resume_swap(image, primary, secondary, scratch, layout, &mut bs);
            }
        }

        let pri_state = read_state_or_empty(self.flash, &primary, &layout);
        // an unreachable secondary is treated as empty, not fatal
        let sec_state = read_state_or_empty(self.flash, &secondary, &layout);
        let ty = decision::swap_type(&pri_state, &sec_state);
        match ty {
            SwapType::Panic => Err(Error::BadState("undecidable trailer state")),
            SwapType::None | SwapType::Fail => {
                self.confirmed_boot_counter_update(image, &primary, &pri_state)
            }
            SwapType::Test | SwapType::Perm => {
                self.start_swap(image, primary, secondary, scratch, layout, ty, false)
            }
            SwapType::Revert => {
                self.start_swap(image, primary, secondary, scratch, layout, ty, true)
            }
        }
    }

    /// Starts a fresh swap (upgrade or revert) after validating the image
    /// that is about to be installed. A secondary that fails validation is
    /// treated as absent and the current primary keeps running.
    #[allow(clippy::too_many_arguments)]
    fn start_swap(
        &mut self,
        image: u8,
        primary: FlashArea,
        secondary: FlashArea,
        scratch: Option<FlashArea>,
        layout: TrailerLayout,
        ty: SwapType,
        reverting: bool,
    ) -> Result<()> {
        let pri_sectors = SectorMap::of_area(self.flash, &primary)?;
        let sec_sectors = SectorMap::of_area(self.flash, &secondary)?;
        let data_off = self.sec_data_off(&sec_sectors, reverting);

        let sec_hdr = match ImageHeader::read_from(self.flash, &secondary, data_off) {
            Ok(header) => header,
            Err(_) => return Ok(()),
        };
        if sec_hdr.is_erased(self.flash.erased_val())
            || !sec_hdr.is_sane(secondary.size - data_off)
            || sec_hdr.is_compressed()
        {
            info!("image {=u8}: no installable secondary image", image);
            return Ok(());
        }

        let max_image_size = swap::max_image_size(
            self.policy,
            &layout,
            &primary,
            &secondary,
            &pri_sectors,
            &sec_sectors,
        );
        let cipher = match load_cipher(
            self.flash,
            &secondary,
            &sec_hdr,
            data_off,
            self.unwrap,
            &self.enc_key,
        ) {
            Ok(cipher) => cipher,
            Err(_) => {
                warning!("image {=u8}: cannot recover the image key", image);
                return Ok(());
            }
        };
        let verdict = validate_image(
            self.flash,
            &secondary,
            &sec_hdr,
            ValidationContext {
                keys: &self.keys,
                sig: self.sig,
                counter: self.counter.as_deref_mut(),
                image_index: image,
                cipher: cipher.as_ref(),
                data_off,
                max_image_size,
            },
        );
        if !verdict.is_pass() {
            warning!("image {=u8}: secondary failed validation, keeping primary", image);
            return Ok(());
        }

        let sec_total = swap::image_total_size(self.flash, &secondary, &sec_hdr, data_off)?;
        let pri_hdr = ImageHeader::read_from(self.flash, &primary, 0)?;
        let pri_total = if !pri_hdr.is_erased(self.flash.erased_val())
            && pri_hdr.is_sane(primary.size)
        {
            swap::image_total_size(self.flash, &primary, &pri_hdr, 0).unwrap_or(0)
        } else {
            0
        };
        let swap_size = sec_total.max(pri_total);

        let enc_secondary = cipher.map(|cipher| EncInfo {
            cipher,
            hdr_size: u32::from(sec_hdr.hdr_size),
            img_size: sec_hdr.img_size,
        });
        let enc_primary = if pri_total > 0 && pri_hdr.encryption().is_some() {
            load_cipher(self.flash, &primary, &pri_hdr, 0, self.unwrap, &self.enc_key)?
                .map(|cipher| EncInfo {
                    cipher,
                    hdr_size: u32::from(pri_hdr.hdr_size),
                    img_size: pri_hdr.img_size,
                })
        } else {
            None
        };

        let mut bs = BootStatus::fresh(ty, swap_size);
        let mut ctx = SwapContext {
            flash: &mut *self.flash,
            primary,
            secondary,
            scratch,
            primary_sectors: pri_sectors,
            secondary_sectors: sec_sectors,
            layout,
            image_index: image,
            enc_primary,
            enc_secondary,
            sec_data_off: data_off,
            watchdog: &mut *self.watchdog,
        };
        swap::execute(self.policy, &mut ctx, &mut bs)?;
        if self.policy != SwapPolicy::Overwrite {
            swap::finalize(&mut ctx, &bs)?;
        }

        if ty == SwapType::Perm || self.policy == SwapPolicy::Overwrite {
            self.installed_counter_update(image, &primary)?;
        }
        Ok(())
    }

    /// Picks an interrupted swap back up at its recorded step.
    fn resume_swap(
        &mut self,
        image: u8,
        primary: FlashArea,
        secondary: FlashArea,
        scratch: Option<FlashArea>,
        layout: TrailerLayout,
        bs: &mut BootStatus,
    ) -> Result<()> {
        info!("image {=u8}: resuming interrupted swap at op {=u32}", image, bs.op_count);
        let pri_sectors = SectorMap::of_area(self.flash, &primary)?;
        let sec_sectors = SectorMap::of_area(self.flash, &secondary)?;
        let reverting = bs.swap_type == SwapType::Revert;
        let data_off = self.sec_data_off(&sec_sectors, reverting);

        let mut enc_primary = None;
        let mut enc_secondary = None;
        if layout.has_enc {
            let source = if bs.source == StatusSource::Scratch {
                scratch.ok_or(Error::BadState("scratch status without scratch area"))?
            } else {
                primary
            };
            let swap_limit = bs.swap_size.div_ceil(layout.write_sz) * layout.write_sz;
            let sector = sec_sectors.get(0).size;
            let units = match self.policy {
                SwapPolicy::Scratch => {
                    let scratch_area =
                        scratch.ok_or(Error::BadState("scratch policy without scratch"))?;
                    let cap = layout.status_off(&scratch_area, true);
                    let mut chunks = [swap::Chunk { off: 0, end: 0, data_len: 0 };
                        config::MAX_IMAGE_SECTORS];
                    swap::build_chunks(&pri_sectors, &sec_sectors, swap_limit, cap, &mut chunks)?
                        as u32
                }
                _ => swap_limit.div_ceil(sector),
            };
            let locations =
                swap::header_locations(self.policy, bs.swap_type, bs.op_count, units, sector);

            let slot_area = |slot: Slot| -> Result<FlashArea> {
                match slot {
                    Slot::Primary => Ok(primary),
                    Slot::Secondary => Ok(secondary),
                    Slot::Scratch => scratch.ok_or(Error::BadState("no scratch area")),
                }
            };
            if let Some(field) = trailer::read_enc_key(self.flash, &source, &layout, 0)? {
                let (slot, off) = locations.from_primary;
                let header = ImageHeader::read_from(self.flash, &slot_area(slot)?, off)?;
                if let Some(aes) = header.encryption() {
                    enc_primary = Some(EncInfo {
                        cipher: ImageCipher::from_field(&field, aes),
                        hdr_size: u32::from(header.hdr_size),
                        img_size: header.img_size,
                    });
                }
            }
            if let Some(field) = trailer::read_enc_key(self.flash, &source, &layout, 1)? {
                let (slot, off) = locations.from_secondary;
                let header = ImageHeader::read_from(self.flash, &slot_area(slot)?, off)?;
                if let Some(aes) = header.encryption() {
                    enc_secondary = Some(EncInfo {
                        cipher: ImageCipher::from_field(&field, aes),
                        hdr_size: u32::from(header.hdr_size),
                        img_size: header.img_size,
                    });
                }
            }
        }

        let swap_type = bs.swap_type;
        let mut ctx = SwapContext {
            flash: &mut *self.flash,
            primary,
            secondary,
            scratch,
            primary_sectors: pri_sectors,
            secondary_sectors: sec_sectors,
            layout,
            image_index: image,
            enc_primary,
            enc_secondary,
            sec_data_off: data_off,
            watchdog: &mut *self.watchdog,
        };
        swap::execute(self.policy, &mut ctx, bs)?;
        swap::finalize(&mut ctx, bs)?;

        if swap_type == SwapType::Perm {
            self.installed_counter_update(image, &primary)?;
        }
        Ok(())
    }

    /// Raises the hardware counter to the freshly installed primary's
    /// value.
    fn installed_counter_update(&mut self, image: u8, primary: &FlashArea) -> Result<()> {
        let Some(counter) = self.counter.as_deref_mut() else {
            return Ok(());
        };
        let header = ImageHeader::read_from(self.flash, primary, 0)?;
        if let Some(value) = read_security_counter(self.flash, primary, &header, 0)? {
            counter.update(image, value).map_err(|_| Error::BadState("counter update"))?;
        }
        Ok(())
    }

    /// A test image that was confirmed gets its counter bump on the first
    /// quiet boot after the confirmation.
    fn confirmed_boot_counter_update(
        &mut self,
        image: u8,
        primary: &FlashArea,
        state: &SwapState,
    ) -> Result<()> {
        if self.counter.is_none()
            || state.image_ok != FlagState::Set
            || state.copy_done != FlagState::Set
        {
            return Ok(());
        }
        self.installed_counter_update(image, primary)
    }

    /// Final gate before jumping: the primary must carry an authentic image.
    fn validate_primary(&mut self, image: u8) -> Result<ImageHeader> {
        let primary = self.map.open(AreaId::primary(image))?;
        let header = ImageHeader::read_from(self.flash, &primary, 0)?;
        let effective_size = if config::VALIDATE_PRIMARY_ONCE {
            primary.size - trailer::MAGIC_SZ
        } else {
            primary.size
        };
        if header.is_erased(self.flash.erased_val()) || !header.is_sane(effective_size) {
            error!("image {=u8}: primary slot holds no sane image", image);
            return Err(Error::BadImage);
        }
        let max_image_size = self.max_size_for(image)?;
        let verdict = validate_image(
            self.flash,
            &primary,
            &header,
            ValidationContext {
                keys: &self.keys,
                sig: self.sig,
                counter: self.counter.as_deref_mut(),
                image_index: image,
                cipher: None,
                data_off: 0,
                max_image_size,
            },
        );
        if !verdict.is_pass() {
            error!("image {=u8}: primary slot failed validation", image);
            return Err(Error::BadImage);
        }
        Ok(header)
    }

    /// Method mirrors of the free helpers, for ports that hold a driver.
    pub fn mark_pending(&mut self, image: u8, permanent: bool) -> Result<()> {
        set_pending(self.flash, &self.map, image, permanent)
    }

    pub fn mark_confirmed(&mut self, image: u8) -> Result<()> {
        set_confirmed(self.flash, &self.map, image)
    }

    pub fn next_action(&mut self, image: u8) -> Result<SwapType> {
        swap_type(self.flash, &self.map, image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enc::testwrap::OwnedPrivateKey;
    use crate::enc::testwrap;
    use crate::hal::doubles::counter::FakeCounter;
    use crate::hal::doubles::flash::FakeFlash;
    use crate::image::testimg::{self, ImageBuilder};
    use crate::image::Version;

    const SLOT: u32 = 0x4000;
    const SECTOR: u32 = 0x400;

    struct Rig {
        flash: FakeFlash,
        map: FlashMap,
        keys: KeyStore<'static>,
        counter: Option<FakeCounter>,
        enc_private: Option<OwnedPrivateKey>,
        policy: SwapPolicy,
        watchdog: (),
    }

    impl Rig {
        fn new(policy: SwapPolicy) -> Rig {
            let flash = FakeFlash::new(&[(34, SECTOR)], 8);
            let map = FlashMap::new(1)
                .add(FlashArea { id: AreaId::primary(0), off: 0, size: SLOT })
                .add(FlashArea { id: AreaId::secondary(0), off: SLOT, size: SLOT })
                .add(FlashArea { id: AreaId::SCRATCH, off: 2 * SLOT, size: 0x800 });
            Rig {
                flash,
                map,
                keys: testimg::store_for(SignatureKind::EcdsaP256),
                counter: None,
                enc_private: None,
                policy,
                watchdog: (),
            }
        }

        fn new_multi() -> Rig {
            let flash = FakeFlash::new(&[(66, SECTOR)], 8);
            let map = FlashMap::new(2)
                .add(FlashArea { id: AreaId::primary(0), off: 0, size: SLOT })
                .add(FlashArea { id: AreaId::secondary(0), off: SLOT, size: SLOT })
                .add(FlashArea { id: AreaId::primary(1), off: 2 * SLOT, size: SLOT })
                .add(FlashArea { id: AreaId::secondary(1), off: 3 * SLOT, size: SLOT })
                .add(FlashArea { id: AreaId::SCRATCH, off: 4 * SLOT, size: 0x800 });
            Rig { map, ..Rig::new(SwapPolicy::Scratch) }
                .with_flash(flash)
        }

        fn with_flash(mut self, flash: FakeFlash) -> Rig {
            self.flash = flash;
            self
        }

        fn install(&mut self, id: AreaId, bytes: &[u8]) {
            let area = self.map.open(id).unwrap();
            let off = if id.is_secondary() && self.policy == SwapPolicy::Offset {
                SECTOR
            } else {
                0
            };
            self.flash.install(area.off + off, bytes);
        }

        fn boot(&mut self) -> Result<BootResponse> {
            let mut driver = Bootloader {
                flash: &mut self.flash,
                map: self.map,
                keys: self.keys,
                enc_key: self.enc_private.as_ref().map(|key| key.borrow()),
                counter: self.counter.as_mut(),
                watchdog: &mut self.watchdog,
                policy: self.policy,
                sig: SignatureKind::EcdsaP256,
                unwrap: UnwrapKind::EciesP256,
                shared_out: None,
            };
            driver.go()
        }

        fn pend(&mut self, permanent: bool) {
            set_pending(&mut self.flash, &self.map, 0, permanent).unwrap();
        }

        fn confirm(&mut self) {
            set_confirmed(&mut self.flash, &self.map, 0).unwrap();
        }

        fn next(&mut self) -> SwapType {
            swap_type(&mut self.flash, &self.map, 0).unwrap()
        }

        fn primary_state(&mut self) -> SwapState {
            let layout = TrailerLayout::new(&self.flash, self.enc_private.is_some());
            let area = self.map.open(AreaId::primary(0)).unwrap();
            trailer::read_swap_state(&mut self.flash, &area, &layout).unwrap()
        }
    }

    fn v1() -> Vec<u8> {
        ImageBuilder::new(Version::new(1, 0, 0, 0)).build()
    }

    fn v2() -> Vec<u8> {
        ImageBuilder::new(Version::new(2, 0, 0, 0)).payload_len(1200).build()
    }

    #[test]
    fn plain_upgrade_installs_the_pending_image() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.install(AreaId::primary(0), &v1());
        rig.install(AreaId::secondary(0), &v2());
        rig.pend(false);
        assert_eq!(rig.next(), SwapType::Test);

        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 2);
        assert_eq!(response.image_off, 0);
        let state = rig.primary_state();
        assert_eq!(state.copy_done, FlagState::Set);
        assert_eq!(state.image_ok, FlagState::Unset);
    }

    #[test]
    fn unconfirmed_test_image_reverts_on_the_next_boot() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.install(AreaId::primary(0), &v1());
        rig.install(AreaId::secondary(0), &v2());
        rig.pend(false);
        rig.boot().unwrap();
        assert_eq!(rig.next(), SwapType::Revert);

        // reboot without the application confirming
        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 1);
        // and the revert does not repeat
        assert_eq!(rig.next(), SwapType::None);
        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 1);
    }

    #[test]
    fn confirmed_test_image_stays() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.install(AreaId::primary(0), &v1());
        rig.install(AreaId::secondary(0), &v2());
        rig.pend(false);
        rig.boot().unwrap();

        rig.confirm();
        assert_eq!(rig.next(), SwapType::None);
        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 2);
    }

    #[test]
    fn bad_signature_on_secondary_keeps_the_primary() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.install(AreaId::primary(0), &v1());
        let bad = ImageBuilder::new(Version::new(2, 0, 0, 0)).corrupt_signature().build();
        rig.install(AreaId::secondary(0), &bad);
        rig.pend(false);

        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 1);
        assert_eq!(rig.primary_state().copy_done, FlagState::Unset);
    }

    #[test]
    fn permanent_upgrade_with_identical_bytes_still_swaps() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        let image = v1();
        rig.install(AreaId::primary(0), &image);
        rig.install(AreaId::secondary(0), &image);
        rig.pend(true);
        assert_eq!(rig.next(), SwapType::Perm);

        rig.boot().unwrap();
        let state = rig.primary_state();
        assert_eq!(state.copy_done, FlagState::Set);
        assert_eq!(state.image_ok, FlagState::Set);
        assert_eq!(rig.next(), SwapType::None);
    }

    #[test]
    fn offset_policy_upgrades_and_reverts() {
        let mut rig = Rig::new(SwapPolicy::Offset);
        rig.install(AreaId::primary(0), &v1());
        rig.install(AreaId::secondary(0), &v2());
        rig.pend(false);
        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 2);

        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 1);
        assert_eq!(rig.next(), SwapType::None);
    }

    #[test]
    fn slide_policy_power_cut_converges_within_two_boots() {
        let mut reference = Rig::new(SwapPolicy::Slide);
        reference.install(AreaId::primary(0), &v1());
        reference.install(AreaId::secondary(0), &v2());
        reference.pend(true);

        // learn the op budget from an uninterrupted run
        let pristine = reference.flash.clone();
        reference.boot().unwrap();
        let total_ops = reference.flash.ops;
        reference.flash = pristine;

        for cut in 0..total_ops {
            let mut rig = Rig::new(SwapPolicy::Slide);
            rig.flash = reference.flash.clone();
            rig.flash.set_budget(Some(cut));
            let _ = rig.boot();
            rig.flash.set_budget(None);

            let mut converged = false;
            for _ in 0..2 {
                if let Ok(response) = rig.boot() {
                    if response.header.version.major == 2
                        && rig.primary_state().copy_done == FlagState::Set
                    {
                        converged = true;
                        break;
                    }
                }
            }
            assert!(converged, "cut after {} ops never converged", cut);
        }
    }

    #[test]
    fn encrypted_upgrade_lands_decrypted_in_the_primary() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.enc_private = Some(testwrap::private_key(UnwrapKind::EciesP256));
        rig.install(AreaId::primary(0), &v1());
        let builder = ImageBuilder::new(Version::new(2, 0, 0, 0))
            .encrypted(UnwrapKind::EciesP256);
        rig.install(AreaId::secondary(0), &builder.build());
        rig.pend(true);

        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 2);

        // the payload at rest in the primary is plaintext
        let area = rig.map.open(AreaId::primary(0)).unwrap();
        let mut payload = vec![0u8; builder.payload.len()];
        area.read(&mut rig.flash, 32, &mut payload).unwrap();
        assert_eq!(payload, builder.payload);
    }

    #[test]
    fn encrypted_power_cut_resume_still_decrypts_correctly() {
        let mut reference = Rig::new(SwapPolicy::Slide);
        reference.enc_private = Some(testwrap::private_key(UnwrapKind::EciesP256));
        reference.install(AreaId::primary(0), &v1());
        let builder = ImageBuilder::new(Version::new(2, 0, 0, 0))
            .payload_len(0x900)
            .encrypted(UnwrapKind::EciesP256);
        reference.install(AreaId::secondary(0), &builder.build());
        reference.pend(true);

        let pristine = reference.flash.clone();
        reference.boot().unwrap();
        let total_ops = reference.flash.ops;
        reference.flash = pristine;

        // sample the budget space; every fourth point keeps the matrix fast
        for cut in (0..total_ops).step_by(4) {
            let mut rig = Rig::new(SwapPolicy::Slide);
            rig.enc_private = Some(testwrap::private_key(UnwrapKind::EciesP256));
            rig.flash = reference.flash.clone();
            rig.flash.set_budget(Some(cut));
            let _ = rig.boot();
            rig.flash.set_budget(None);

            let mut ok = false;
            for _ in 0..2 {
                if let Ok(response) = rig.boot() {
                    if response.header.version.major == 2 {
                        ok = true;
                        break;
                    }
                }
            }
            assert!(ok, "cut after {} ops never converged", cut);
            let area = rig.map.open(AreaId::primary(0)).unwrap();
            let mut payload = vec![0u8; builder.payload.len()];
            area.read(&mut rig.flash, 32, &mut payload).unwrap();
            assert_eq!(payload, builder.payload, "cut after {} ops", cut);
        }
    }

    #[test]
    fn rollback_counter_blocks_and_then_admits_upgrades() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.counter = Some(FakeCounter::with_value(0, 5));
        rig.install(
            AreaId::primary(0),
            &ImageBuilder::new(Version::new(1, 0, 0, 0)).sec_cnt(5).build(),
        );
        let stale = ImageBuilder::new(Version::new(2, 0, 0, 0)).sec_cnt(4).build();
        rig.install(AreaId::secondary(0), &stale);
        rig.pend(true);
        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 1);

        // a fresh enough image is admitted, and the counter advances
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.counter = Some(FakeCounter::with_value(0, 5));
        rig.install(
            AreaId::primary(0),
            &ImageBuilder::new(Version::new(1, 0, 0, 0)).sec_cnt(5).build(),
        );
        let fresh = ImageBuilder::new(Version::new(2, 0, 0, 0)).sec_cnt(6).build();
        rig.install(AreaId::secondary(0), &fresh);
        rig.pend(true);
        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 2);
        assert_eq!(rig.counter.as_ref().unwrap().values[0], 6);
    }

    #[test]
    fn multiple_image_pairs_decide_independently() {
        let mut rig = Rig::new_multi();
        rig.install(AreaId::primary(0), &v1());
        rig.install(AreaId::primary(1), &v1());
        rig.install(AreaId::secondary(1), &v2());
        set_pending(&mut rig.flash, &rig.map, 1, true).unwrap();

        let response = rig.boot().unwrap();
        // the response names image 0, untouched
        assert_eq!(response.header.version.major, 1);
        // image 1 was upgraded in place
        let area = rig.map.open(AreaId::primary(1)).unwrap();
        let header = ImageHeader::read_from(&mut rig.flash, &area, 0).unwrap();
        assert_eq!(header.version.major, 2);
    }

    #[test]
    fn empty_primary_with_no_update_is_a_panic() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        assert_eq!(rig.boot().unwrap_err(), Error::BadImage);
    }

    #[test]
    fn overwrite_policy_installs_and_consumes_the_update() {
        let mut rig = Rig::new(SwapPolicy::Overwrite);
        rig.install(AreaId::primary(0), &v1());
        rig.install(AreaId::secondary(0), &v2());
        rig.pend(true);

        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 2);
        // the source header is gone, so the next boot does nothing
        assert_eq!(rig.next(), SwapType::None);
        let response = rig.boot().unwrap();
        assert_eq!(response.header.version.major, 2);
    }

    #[test]
    fn shared_data_blob_is_published_before_jumping() {
        let mut rig = Rig::new(SwapPolicy::Scratch);
        rig.install(AreaId::primary(0), &v1());
        let mut region = [0u8; 128];
        {
            let mut driver = Bootloader {
                flash: &mut rig.flash,
                map: rig.map,
                keys: rig.keys,
                enc_key: None,
                counter: None::<&mut FakeCounter>,
                watchdog: &mut rig.watchdog,
                policy: rig.policy,
                sig: SignatureKind::EcdsaP256,
                unwrap: UnwrapKind::EciesP256,
                shared_out: Some(&mut region),
            };
            driver.go().unwrap();
        }
        assert_eq!(
            u16::from_le_bytes([region[0], region[1]]),
            crate::shared_data::INFO_MAGIC
        );
        let total = u16::from_le_bytes([region[2], region[3]]);
        assert!(total > 6);
    }
}

