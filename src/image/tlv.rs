//! Type-Length-Value records trailing the image payload.
//!
//! Two regions follow the payload, each introduced by a 4-byte info record:
//! the protected region (covered by the image hash, magic 0x6908) and the
//! unprotected region (magic 0x6907). The unprotected region may only carry
//! the record types needed to check the image: signatures, key identifiers,
//! hashes, wrapped encryption keys. Anything else fails iteration.

use crate::area::FlashArea;
use crate::error::{Error, Result};
use crate::hal::flash::Flash;

/// Unprotected-region info magic.
pub const INFO_MAGIC: u16 = 0x6907;
/// Protected-region info magic. Also reserved for SUIT-style manifests.
pub const PROT_INFO_MAGIC: u16 = 0x6908;

/// Record types.
pub const KEYHASH: u16 = 0x01;
pub const PUBKEY: u16 = 0x02;
pub const KEYID: u16 = 0x05;
pub const SHA256: u16 = 0x10;
pub const SHA384: u16 = 0x11;
pub const SHA512: u16 = 0x12;
pub const RSA2048_PSS: u16 = 0x20;
pub const ECDSA224: u16 = 0x21;
pub const ECDSA_SIG: u16 = 0x22;
pub const RSA3072_PSS: u16 = 0x23;
pub const ED25519: u16 = 0x24;
pub const SIG_PURE: u16 = 0x25;
pub const ENC_RSA2048: u16 = 0x30;
pub const ENC_KW: u16 = 0x31;
pub const ENC_EC256: u16 = 0x32;
pub const ENC_X25519: u16 = 0x33;
pub const ENC_X25519_SHA512: u16 = 0x35;
pub const DEPENDENCY: u16 = 0x40;
pub const SEC_CNT: u16 = 0x50;
pub const BOOT_RECORD: u16 = 0x60;
/// Filter wildcard; never appears on flash.
pub const ANY: u16 = 0xffff;

/// The only types permitted in the unprotected region.
const ALLOWED_UNPROTECTED: &[u16] = &[
    KEYHASH,
    PUBKEY,
    KEYID,
    SHA256,
    SHA384,
    SHA512,
    RSA2048_PSS,
    ECDSA224,
    ECDSA_SIG,
    RSA3072_PSS,
    ED25519,
    SIG_PURE,
    ENC_RSA2048,
    ENC_KW,
    ENC_EC256,
    ENC_X25519,
    ENC_X25519_SHA512,
];

/// One decoded record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TlvEntry {
    /// Area-relative offset of the value bytes.
    pub off: u32,
    pub len: u16,
    pub kind: u16,
    /// Whether the record lies in the hash-covered region.
    pub protected: bool,
}

/// Walks the TLV regions of one image.
///
/// The cursor holds offsets only; each call borrows the flash afresh, so the
/// caller is free to read record values between steps.
#[derive(Debug)]
pub struct TlvCursor {
    filter: u16,
    prot_only: bool,
    base: u32,
    prot_end: u32,
    tlv_end: u32,
    off: u32,
}

fn read_u16<F: Flash>(flash: &mut F, area: &FlashArea, off: u32) -> Result<u16> {
    let mut bytes = [0u8; 2];
    area.read(flash, off, &mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

impl TlvCursor {
    /// Positions a cursor after the first info record.
    ///
    /// `data_off` is the slot data offset (non-zero for a secondary slot
    /// under the offset upgrade strategy); every produced offset already
    /// includes it. `tlv_off` of the header plus the declared region lengths
    /// must be internally consistent or iteration refuses to start.
    pub fn begin<F: Flash>(
        flash: &mut F,
        area: &FlashArea,
        header: &crate::image::ImageHeader,
        data_off: u32,
        filter: u16,
        prot_only: bool,
    ) -> Result<TlvCursor> {
        let base = data_off + header.tlv_off();
        let magic = read_u16(flash, area, base)?;
        let total = read_u16(flash, area, base + 2)?;

        let (prot_end, tlv_end) = if magic == PROT_INFO_MAGIC {
            if total != header.protect_tlv_size {
                debug!("protected TLV length disagrees with header");
                return Err(Error::BadImage);
            }
            let prot_end = base + u32::from(total);
            let magic = read_u16(flash, area, prot_end)?;
            let unprot_total = read_u16(flash, area, prot_end + 2)?;
            if magic != INFO_MAGIC {
                return Err(Error::BadImage);
            }
            (prot_end, prot_end + u32::from(unprot_total))
        } else if magic == INFO_MAGIC {
            if header.protect_tlv_size != 0 {
                debug!("header promises protected TLVs but none are present");
                return Err(Error::BadImage);
            }
            (base, base + u32::from(total))
        } else {
            return Err(Error::BadImage);
        };

        if tlv_end > area.size {
            return Err(Error::NoPayload);
        }

        Ok(TlvCursor { filter, prot_only, base, prot_end, tlv_end, off: base + 4 })
    }

    /// End of the TLV regions, relative to the image start (the slot data
    /// offset is excluded again). This is the total on-flash image size.
    pub fn image_end(&self, data_off: u32) -> u32 {
        self.tlv_end - data_off
    }

    /// Next matching record, or `None` past the end of the selected
    /// region(s).
    pub fn next<F: Flash>(&mut self, flash: &mut F, area: &FlashArea) -> Result<Option<TlvEntry>> {
        loop {
            if self.off == self.prot_end && self.prot_end != self.base {
                // step over the unprotected region's info record
                self.off += 4;
            }
            let limit = if self.prot_only { self.prot_end } else { self.tlv_end };
            if self.off + 4 > limit {
                return Ok(None);
            }

            let kind = read_u16(flash, area, self.off)?;
            let len = read_u16(flash, area, self.off + 2)?;
            let value_off = self.off + 4;
            if value_off + u32::from(len) > self.tlv_end {
                return Err(Error::NoPayload);
            }
            let protected = self.prot_end != self.base && self.off < self.prot_end;

            if !protected && !ALLOWED_UNPROTECTED.contains(&kind) {
                debug!("TLV type {=u16} not permitted unprotected", kind);
                return Err(Error::BadImage);
            }

            self.off = value_off + u32::from(len);
            if self.filter == ANY || self.filter == kind {
                return Ok(Some(TlvEntry { off: value_off, len, kind, protected }));
            }
        }
    }
}
