//! Rolling digest over header, payload and protected TLVs.

use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::area::FlashArea;
use crate::config::SCRATCH_BUF_SIZE;
use crate::enc::ImageCipher;
use crate::error::Result;
use crate::hal::flash::Flash;
use crate::image::{tlv, ImageHeader};

/// The hash functions an image may be sealed with. The active signature
/// kind dictates which one is expected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DigestKind {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestKind {
    pub fn len(self) -> usize {
        match self {
            DigestKind::Sha256 => 32,
            DigestKind::Sha384 => 48,
            DigestKind::Sha512 => 64,
        }
    }

    /// The TLV record type carrying this digest.
    pub fn tlv_kind(self) -> u16 {
        match self {
            DigestKind::Sha256 => tlv::SHA256,
            DigestKind::Sha384 => tlv::SHA384,
            DigestKind::Sha512 => tlv::SHA512,
        }
    }
}

/// A finished digest. Sized for the largest supported function.
#[derive(Copy, Clone)]
pub struct ImageHash {
    bytes: [u8; 64],
    len: usize,
}

impl ImageHash {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

enum Ctx {
    S256(Sha256),
    S384(Sha384),
    S512(Sha512),
}

impl Ctx {
    fn new(kind: DigestKind) -> Ctx {
        match kind {
            DigestKind::Sha256 => Ctx::S256(Sha256::new()),
            DigestKind::Sha384 => Ctx::S384(Sha384::new()),
            DigestKind::Sha512 => Ctx::S512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Ctx::S256(c) => c.update(data),
            Ctx::S384(c) => c.update(data),
            Ctx::S512(c) => c.update(data),
        }
    }

    fn finish(self) -> ImageHash {
        let mut hash = ImageHash { bytes: [0; 64], len: 0 };
        match self {
            Ctx::S256(c) => {
                hash.bytes[..32].copy_from_slice(&c.finalize());
                hash.len = 32;
            }
            Ctx::S384(c) => {
                hash.bytes[..48].copy_from_slice(&c.finalize());
                hash.len = 48;
            }
            Ctx::S512(c) => {
                hash.bytes[..64].copy_from_slice(&c.finalize());
                hash.len = 64;
            }
        }
        hash
    }
}

/// Digests `hdr_size + img_size + protect_tlv_size` bytes of the image in
/// `area`, starting at `data_off`.
///
/// When `cipher` is given (an encrypted image sitting in a secondary slot),
/// the payload strictly between the header and the TLVs is decrypted on the
/// fly; header and protected TLVs always hash verbatim. Plaintext images on
/// memory-mapped storage hash in a single call.
pub fn hash_image<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    header: &ImageHeader,
    kind: DigestKind,
    cipher: Option<&ImageCipher>,
    data_off: u32,
) -> Result<ImageHash> {
    let hdr_size = u32::from(header.hdr_size);
    let payload_end = header.tlv_off();
    let size = payload_end + u32::from(header.protect_tlv_size);

    let mut ctx = Ctx::new(kind);

    if cipher.is_none() {
        if let Some(view) = flash.mapped(area.off + data_off, size) {
            ctx.update(view);
            return Ok(ctx.finish());
        }
    }

    let mut buf = [0u8; SCRATCH_BUF_SIZE];
    let mut off = 0u32;
    while off < size {
        let mut chunk = (size - off).min(SCRATCH_BUF_SIZE as u32);
        if cipher.is_some() {
            // never mix header or TLV bytes into a decrypted block
            if off < hdr_size && off + chunk > hdr_size {
                chunk = hdr_size - off;
            }
            if off < payload_end && off + chunk > payload_end {
                chunk = payload_end - off;
            }
        }
        let slice = &mut buf[..chunk as usize];
        area.read(flash, data_off + off, slice)?;
        if let Some(cipher) = cipher {
            if off >= hdr_size && off < payload_end {
                cipher.decrypt(off - hdr_size, slice);
            }
        }
        ctx.update(slice);
        off += chunk;
    }
    Ok(ctx.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::AreaId;
    use crate::hal::doubles::flash::FakeFlash;
    use crate::image::IMAGE_MAGIC;
    use sha2::Digest as _;

    fn fixture() -> (FakeFlash, FlashArea, ImageHeader, Vec<u8>) {
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            hdr_size: 32,
            img_size: 700,
            protect_tlv_size: 0,
            ..Default::default()
        };
        let mut image = header.to_bytes().to_vec();
        image.extend((0..700u32).map(|i| (i % 251) as u8));
        let mut flash = FakeFlash::new(&[(4, 0x400)], 8);
        flash.install(0, &image);
        (flash, FlashArea { id: AreaId::primary(0), off: 0, size: 0x1000 }, header, image)
    }

    #[test]
    fn digest_covers_header_and_payload() {
        let (mut flash, area, header, image) = fixture();
        let hash = hash_image(&mut flash, &area, &header, DigestKind::Sha256, None, 0).unwrap();
        let expected = sha2::Sha256::digest(&image);
        assert_eq!(hash.as_slice(), expected.as_slice());
    }

    #[test]
    fn memory_mapped_and_chunked_paths_agree() {
        let (mut flash, area, header, _) = fixture();
        let chunked = hash_image(&mut flash, &area, &header, DigestKind::Sha512, None, 0).unwrap();
        flash.enable_mmap();
        let mapped = hash_image(&mut flash, &area, &header, DigestKind::Sha512, None, 0).unwrap();
        assert_eq!(chunked.as_slice(), mapped.as_slice());
        assert_eq!(chunked.as_slice().len(), 64);
    }

    #[test]
    fn wider_digest_kinds_have_their_sizes() {
        let (mut flash, area, header, _) = fixture();
        let h384 = hash_image(&mut flash, &area, &header, DigestKind::Sha384, None, 0).unwrap();
        assert_eq!(h384.as_slice().len(), 48);
    }
}
