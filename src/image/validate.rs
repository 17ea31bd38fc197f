//! Image validation: hash, signature, TLV discipline, anti-rollback.
//!
//! The terminal result is a hardened [`Verdict`]; every internal acceptance
//! feeds it through hardened combinators so no single flipped branch can
//! turn a rejection into an acceptance.

use crate::area::FlashArea;
use crate::enc::ImageCipher;
use crate::error::Result;
use crate::hal::counter::SecurityCounter;
use crate::hal::flash::Flash;
use crate::hardened::{self, Verdict};
use crate::image::hash::hash_image;
use crate::image::signature::{locate_key, SignatureKind, KEY_TLV_BUF_LEN, SIG_BUF_LEN};
use crate::image::{tlv, ImageHeader};
use crate::keys::KeyStore;

/// Everything validation needs beyond the image itself.
pub struct ValidationContext<'a, SC: SecurityCounter> {
    pub keys: &'a KeyStore<'a>,
    pub sig: SignatureKind,
    /// Rollback protection; when present, a SEC_CNT record is mandatory.
    pub counter: Option<&'a mut SC>,
    pub image_index: u8,
    /// Decryption schedule when the image sits encrypted in its slot.
    pub cipher: Option<&'a ImageCipher>,
    /// Slot data offset (offset-strategy secondary slots).
    pub data_off: u32,
    /// Largest acceptable total image size in this slot.
    pub max_image_size: u32,
}

/// Validates one image in place. Any structural error, unknown unprotected
/// record, hash or signature mismatch, or rollback violation fails the
/// verdict; flash faults fail it too (a slot that cannot be read cannot be
/// trusted either).
pub fn validate_image<F: Flash, SC: SecurityCounter>(
    flash: &mut F,
    area: &FlashArea,
    header: &ImageHeader,
    mut ctx: ValidationContext<'_, SC>,
) -> Verdict {
    match validate_inner(flash, area, header, &mut ctx) {
        Ok(verdict) => verdict,
        Err(_) => {
            debug!("validation aborted by structural or flash error");
            Verdict::fail()
        }
    }
}

fn validate_inner<F: Flash, SC: SecurityCounter>(
    flash: &mut F,
    area: &FlashArea,
    header: &ImageHeader,
    ctx: &mut ValidationContext<'_, SC>,
) -> Result<Verdict> {
    let digest = match ctx.sig.digest_kind() {
        Some(kind) => {
            Some(hash_image(flash, area, header, kind, ctx.cipher, ctx.data_off)?)
        }
        None => {
            if !pure_marker_present(flash, area, header, ctx.data_off)? {
                debug!("pure signature mode requires a SIG_PURE marker");
                return Ok(Verdict::fail());
            }
            None
        }
    };

    let mut cursor =
        tlv::TlvCursor::begin(flash, area, header, ctx.data_off, tlv::ANY, false)?;
    if cursor.image_end(ctx.data_off) > ctx.max_image_size {
        debug!("TLVs extend beyond the permitted image size");
        return Ok(Verdict::fail());
    }

    let mut hash_verdict = Verdict::fail();
    let mut sig_verdict = Verdict::fail();
    let mut counter_verdict = Verdict::fail();
    let mut selected_key: Option<usize> = None;
    let mut signed_keys: u32 = 0;

    while let Some(entry) = cursor.next(flash, area)? {
        match entry.kind {
            kind if Some(kind) == ctx.sig.digest_kind().map(|d| d.tlv_kind()) => {
                let Some(digest) = digest.as_ref() else {
                    return Ok(Verdict::fail());
                };
                if usize::from(entry.len) != digest.as_slice().len() {
                    return Ok(Verdict::fail());
                }
                let mut stored = [0u8; 64];
                let stored = &mut stored[..usize::from(entry.len)];
                area.read(flash, entry.off, stored)?;
                hash_verdict = hardened::memequal(digest.as_slice(), stored);
                if !hash_verdict.is_pass() {
                    debug!("image hash mismatch");
                    return Ok(Verdict::fail());
                }
            }
            tlv::KEYHASH | tlv::PUBKEY | tlv::KEYID => {
                if usize::from(entry.len) > KEY_TLV_BUF_LEN {
                    return Ok(Verdict::fail());
                }
                let mut buf = [0u8; KEY_TLV_BUF_LEN];
                let value = &mut buf[..usize::from(entry.len)];
                area.read(flash, entry.off, value)?;
                // an unknown key is not an error; another record may match
                selected_key = locate_key(ctx.keys, entry.kind, value);
            }
            kind if kind == ctx.sig.sig_tlv() => {
                let Some(key_index) = selected_key.take() else {
                    continue;
                };
                if !ctx.sig.len_acceptable(usize::from(entry.len)) {
                    return Ok(Verdict::fail());
                }
                let mut buf = [0u8; SIG_BUF_LEN];
                let signature = &mut buf[..usize::from(entry.len)];
                area.read(flash, entry.off, signature)?;
                let key = ctx.keys.get(key_index);
                let verdict = match &digest {
                    Some(digest) => ctx.sig.verify(key.material, digest.as_slice(), signature),
                    None => {
                        let len = header.tlv_off() + u32::from(header.protect_tlv_size);
                        let Some(message) =
                            flash.mapped(area.off + ctx.data_off, len)
                        else {
                            debug!("pure signatures need memory-mapped flash");
                            return Ok(Verdict::fail());
                        };
                        ctx.sig.verify(key.material, message, signature)
                    }
                };
                if verdict.is_pass() {
                    signed_keys |= 1 << key_index;
                    sig_verdict = verdict;
                }
            }
            tlv::SEC_CNT => {
                let Some(counter) = ctx.counter.as_deref_mut() else {
                    continue;
                };
                if entry.len != 4 {
                    return Ok(Verdict::fail());
                }
                let mut value = [0u8; 4];
                area.read(flash, entry.off, &mut value)?;
                let image_cnt = u32::from_le_bytes(value);
                let Ok(stored) = counter.get(ctx.image_index) else {
                    return Ok(Verdict::fail());
                };
                if image_cnt < stored {
                    info!(
                        "rollback rejected: image counter {=u32} below stored {=u32}",
                        image_cnt, stored
                    );
                    return Ok(Verdict::fail());
                }
                counter_verdict = Verdict::pass();
            }
            _ => {}
        }
    }

    // every gate re-checks its verdict; missing records never pass
    let mut verdict = sig_verdict;
    if ctx.sig.digest_kind().is_some() {
        verdict = verdict.and(hash_verdict);
    }
    if ctx.counter.is_some() {
        verdict = verdict.and(counter_verdict);
    }
    for index in 0..ctx.keys.len() {
        if ctx.keys.get(index).must_sign && signed_keys & (1 << index) == 0 {
            debug!("required key {=usize} did not sign", index);
            return Ok(Verdict::fail());
        }
    }
    Ok(verdict)
}

fn pure_marker_present<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    header: &ImageHeader,
    data_off: u32,
) -> Result<bool> {
    let mut cursor =
        tlv::TlvCursor::begin(flash, area, header, data_off, tlv::SIG_PURE, false)?;
    if let Some(entry) = cursor.next(flash, area)? {
        if entry.len == 1 {
            let mut value = [0u8; 1];
            area.read(flash, entry.off, &mut value)?;
            return Ok(value[0] == 1);
        }
    }
    Ok(false)
}

/// The image's declared security counter, for the post-swap hardware
/// update. `None` when the record is absent.
pub fn read_security_counter<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    header: &ImageHeader,
    data_off: u32,
) -> Result<Option<u32>> {
    let mut cursor =
        tlv::TlvCursor::begin(flash, area, header, data_off, tlv::SEC_CNT, true)?;
    match cursor.next(flash, area)? {
        Some(entry) if entry.len == 4 => {
            let mut value = [0u8; 4];
            area.read(flash, entry.off, &mut value)?;
            Ok(Some(u32::from_le_bytes(value)))
        }
        _ => Ok(None),
    }
}
