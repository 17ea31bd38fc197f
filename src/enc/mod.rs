//! Image encryption: key unwrapping and the payload stream cipher.
//!
//! An encrypted image carries its AES key wrapped in an unprotected TLV.
//! The key is unwrapped once, before any sector moves, and from then on the
//! payload is transformed with AES-CTR whose 16-byte nonce is 12 zero bytes
//! followed by the big-endian 16-byte-block index within the image
//! (`image_offset >> 4`).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::{Aes128, Aes256};

use crate::crypto::{ecies, keywrap, rsa};
use crate::error::{Error, Result};
use crate::image::{tlv, AesKind};
use crate::keys::EncPrivateKey;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Size of the trailer field holding an unwrapped key.
pub const KEY_FIELD_LEN: usize = 32;

/// Largest wrapped-key TLV across the algorithms (RSA-2048).
pub const WRAPPED_MAX: usize = 256;

/// The supported key-unwrap algorithms. One is active per build.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnwrapKind {
    EciesP256,
    EciesX25519,
    AesKeyWrap,
    RsaOaep,
}

impl UnwrapKind {
    /// The TLV record type carrying the wrapped key.
    pub fn tlv_kind(self) -> u16 {
        match self {
            UnwrapKind::EciesP256 => tlv::ENC_EC256,
            UnwrapKind::EciesX25519 => tlv::ENC_X25519,
            UnwrapKind::AesKeyWrap => tlv::ENC_KW,
            UnwrapKind::RsaOaep => tlv::ENC_RSA2048,
        }
    }

    /// Exact wrapped-key TLV length for an image sealed with `aes`.
    pub fn wrapped_len(self, aes: AesKind) -> usize {
        match self {
            UnwrapKind::EciesP256 => {
                ecies::P256_POINT_LEN + ecies::TAG_LEN + aes.key_len()
            }
            UnwrapKind::EciesX25519 => {
                ecies::X25519_POINT_LEN + ecies::TAG_LEN + aes.key_len()
            }
            UnwrapKind::AesKeyWrap => aes.key_len() + 8,
            UnwrapKind::RsaOaep => 256,
        }
    }
}

/// An unwrapped image key plus the AES-CTR transform over payload bytes.
///
/// CTR is an involution, so `encrypt` and `decrypt` are the same keystream;
/// both names exist because call sites read better for it.
#[derive(Copy, Clone, Debug)]
pub struct ImageCipher {
    key: [u8; KEY_FIELD_LEN],
    kind: AesKind,
}

impl ImageCipher {
    pub fn new(key: &[u8], kind: AesKind) -> ImageCipher {
        debug_assert_eq!(key.len(), kind.key_len());
        let mut cipher = ImageCipher { key: [0xff; KEY_FIELD_LEN], kind };
        cipher.key[..key.len()].copy_from_slice(key);
        cipher
    }

    /// Rebuilds a cipher from the trailer key field.
    pub fn from_field(field: &[u8; KEY_FIELD_LEN], kind: AesKind) -> ImageCipher {
        ImageCipher { key: *field, kind }
    }

    /// The trailer key field image: key bytes, tail padded with 0xff so an
    /// absent key stays recognisable as fully erased flash.
    pub fn field(&self) -> [u8; KEY_FIELD_LEN] {
        self.key
    }

    fn keystream(&self, image_off: u32, buf: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[12..16].copy_from_slice(&(image_off >> 4).to_be_bytes());
        let iv = GenericArray::from_slice(&iv);
        let intra = u64::from(image_off & 0xf);
        match self.kind {
            AesKind::Aes128 => {
                let key = GenericArray::from_slice(&self.key[..16]);
                let mut ctr = Aes128Ctr::new(key, iv);
                ctr.seek(intra);
                ctr.apply_keystream(buf);
            }
            AesKind::Aes256 => {
                let key = GenericArray::from_slice(&self.key[..32]);
                let mut ctr = Aes256Ctr::new(key, iv);
                ctr.seek(intra);
                ctr.apply_keystream(buf);
            }
        }
    }

    /// Transforms `buf`, which sits at `image_off` bytes into the payload.
    pub fn encrypt(&self, image_off: u32, buf: &mut [u8]) {
        self.keystream(image_off, buf);
    }

    pub fn decrypt(&self, image_off: u32, buf: &mut [u8]) {
        self.keystream(image_off, buf);
    }
}

/// Recovers the image key from its wrapped TLV value.
pub fn unwrap_key(
    kind: UnwrapKind,
    private: &EncPrivateKey,
    wrapped: &[u8],
    aes: AesKind,
) -> Result<ImageCipher> {
    let key_len = aes.key_len();
    if wrapped.len() != kind.wrapped_len(aes) {
        return Err(Error::BadImage);
    }
    let mut key = [0u8; KEY_FIELD_LEN];
    match (kind, private) {
        (UnwrapKind::EciesP256, EncPrivateKey::P256(private)) => {
            let point = &wrapped[..ecies::P256_POINT_LEN];
            let tag = &wrapped[ecies::P256_POINT_LEN..ecies::P256_POINT_LEN + ecies::TAG_LEN];
            let ciphered = &wrapped[ecies::P256_POINT_LEN + ecies::TAG_LEN..];
            let shared = ecies::p256_shared(private, point)?;
            ecies_finish(&shared, tag, ciphered, &mut key[..key_len])?;
        }
        (UnwrapKind::EciesX25519, EncPrivateKey::X25519(private)) => {
            let point: &[u8; 32] = wrapped[..32].try_into().map_err(|_| Error::BadImage)?;
            let tag = &wrapped[32..64];
            let ciphered = &wrapped[64..];
            let shared = ecies::x25519_shared(private, point);
            ecies_finish(&shared, tag, ciphered, &mut key[..key_len])?;
        }
        (UnwrapKind::AesKeyWrap, EncPrivateKey::Kek(kek)) => {
            let n = keywrap::unwrap(kek, wrapped, &mut key)?;
            if n != key_len {
                return Err(Error::BadImage);
            }
        }
        (UnwrapKind::RsaOaep, EncPrivateKey::Rsa(private)) => {
            let n = rsa::oaep_unwrap(private, wrapped, &mut key)?;
            if n != key_len {
                return Err(Error::BadImage);
            }
        }
        _ => return Err(Error::BadState("decryption key kind mismatch")),
    }
    Ok(ImageCipher::new(&key[..key_len], aes))
}

/// Shared ECIES tail: derive keys, authenticate, strip the key ciphering.
fn ecies_finish(shared: &[u8; 32], tag: &[u8], ciphered: &[u8], out: &mut [u8]) -> Result<()> {
    let keys = ecies::derive_keys(shared)?;
    if !ecies::verify_tag(&keys.hmac, ciphered, tag) {
        return Err(Error::BadImage);
    }
    out.copy_from_slice(ciphered);
    // the key itself is ciphered with the derived key and a zero counter
    ImageCipher::new(&keys.aes, AesKind::Aes256).decrypt(0, out);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [UnwrapKind; 4] = [
        UnwrapKind::EciesP256,
        UnwrapKind::EciesX25519,
        UnwrapKind::AesKeyWrap,
        UnwrapKind::RsaOaep,
    ];

    #[test]
    fn wrap_then_unwrap_is_identity_for_every_algorithm() {
        let key = [0x5au8; 16];
        for kind in ALL_KINDS {
            let wrapped = testwrap::wrap(kind, &key);
            assert_eq!(wrapped.len(), kind.wrapped_len(AesKind::Aes128), "{:?}", kind);
            let private = testwrap::private_key(kind);
            let cipher =
                unwrap_key(kind, &private.borrow(), &wrapped, AesKind::Aes128).unwrap();
            assert_eq!(&cipher.field()[..16], &key, "{:?}", kind);
        }
    }

    #[test]
    fn tampered_wrapping_is_rejected() {
        for kind in ALL_KINDS {
            let mut wrapped = testwrap::wrap(kind, &[0x5au8; 16]);
            let mid = wrapped.len() / 2;
            wrapped[mid] ^= 0x01;
            let private = testwrap::private_key(kind);
            assert!(
                unwrap_key(kind, &private.borrow(), &wrapped, AesKind::Aes128).is_err(),
                "{:?}",
                kind
            );
        }
    }

    #[test]
    fn wrong_length_tlv_is_rejected_up_front() {
        let private = testwrap::private_key(UnwrapKind::EciesP256);
        assert_eq!(
            unwrap_key(UnwrapKind::EciesP256, &private.borrow(), &[0u8; 10], AesKind::Aes128)
                .unwrap_err(),
            Error::BadImage
        );
    }

    #[test]
    fn keystream_is_position_independent_of_chunking() {
        let cipher = ImageCipher::new(&[0x33; 16], AesKind::Aes128);
        let mut whole: Vec<u8> = (0u16..200).map(|i| i as u8).collect();
        let mut split = whole.clone();
        cipher.encrypt(0, &mut whole);
        // same bytes through two unaligned chunks
        cipher.encrypt(0, &mut split[..37]);
        cipher.encrypt(37, &mut split[37..]);
        assert_eq!(whole, split);
    }

    #[test]
    fn decrypt_reverses_encrypt_at_any_offset() {
        let cipher = ImageCipher::new(&[0x90; 32], AesKind::Aes256);
        let plain: Vec<u8> = (0u16..100).map(|i| (i * 3) as u8).collect();
        let mut buf = plain.clone();
        cipher.encrypt(123, &mut buf);
        assert_ne!(buf, plain);
        cipher.decrypt(123, &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn aes256_images_round_trip_too() {
        let key = [0x21u8; 32];
        let wrapped = testwrap::wrap(UnwrapKind::EciesP256, &key);
        let private = testwrap::private_key(UnwrapKind::EciesP256);
        let cipher =
            unwrap_key(UnwrapKind::EciesP256, &private.borrow(), &wrapped, AesKind::Aes256)
                .unwrap();
        assert_eq!(cipher.field(), key);
    }
}
