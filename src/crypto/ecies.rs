//! ECIES building blocks shared by the P-256 and X25519 key-unwrap paths.
//!
//! The wrapped-key TLV holds an ephemeral public point, an HMAC tag over the
//! ciphered key, and the ciphered key itself. The shared secret expands
//! through HKDF-SHA256 (empty salt, info `MCUBoot_ECIES_v1`) into 32 bytes
//! of AES key material followed by 32 bytes of HMAC key material.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

/// KDF info tag, fixed by the image format.
pub const KDF_INFO: &[u8] = b"MCUBoot_ECIES_v1";

/// SEC1 uncompressed point length for P-256.
pub const P256_POINT_LEN: usize = 65;
/// X25519 public key length.
pub const X25519_POINT_LEN: usize = 32;
/// HMAC-SHA256 tag length.
pub const TAG_LEN: usize = 32;

/// Key material derived from one shared secret.
pub struct DerivedKeys {
    pub aes: [u8; 32],
    pub hmac: [u8; 32],
}

/// HKDF-SHA256 expansion of a shared secret into cipher and MAC keys.
pub fn derive_keys(shared: &[u8]) -> Result<DerivedKeys> {
    let kdf = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 64];
    kdf.expand(KDF_INFO, &mut okm).map_err(|_| Error::BadState("HKDF expand"))?;
    let mut keys = DerivedKeys { aes: [0; 32], hmac: [0; 32] };
    keys.aes.copy_from_slice(&okm[..32]);
    keys.hmac.copy_from_slice(&okm[32..]);
    Ok(keys)
}

/// Constant-time check of the TLV's tag over the ciphered key field.
pub fn verify_tag(hmac_key: &[u8; 32], ciphered_key: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(hmac_key) else {
        return false;
    };
    mac.update(ciphered_key);
    mac.verify_slice(tag).is_ok()
}

/// ECDH over P-256: recipient private key (PKCS#8 DER or raw scalar) against
/// the sender's ephemeral public point.
pub fn p256_shared(private_key: &[u8], ephemeral: &[u8]) -> Result<[u8; 32]> {
    use p256::pkcs8::DecodePrivateKey;
    use p256::{ecdh, PublicKey, SecretKey};

    let secret = SecretKey::from_pkcs8_der(private_key)
        .ok()
        .or_else(|| SecretKey::from_slice(private_key).ok())
        .ok_or(Error::BadState("bad P-256 private key"))?;
    let public = PublicKey::from_sec1_bytes(ephemeral).map_err(|_| Error::BadImage)?;
    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(out)
}

/// X25519 agreement between the recipient scalar and the ephemeral point.
pub fn x25519_shared(private_key: &[u8; 32], ephemeral: &[u8; 32]) -> [u8; 32] {
    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*ephemeral);
    *secret.diffie_hellman(&public).as_bytes()
}

#[cfg(test)]
pub mod testkeys {
    use super::*;

    pub const P256_SEED: [u8; 32] = [0x29; 32];
    pub const X25519_SEED: [u8; 32] = [0x3d; 32];

    pub fn p256_private_der() -> Vec<u8> {
        use p256::pkcs8::EncodePrivateKey;
        p256::SecretKey::from_slice(&P256_SEED)
            .unwrap()
            .to_pkcs8_der()
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    /// Sender side of ECIES-P256: returns (ephemeral point, shared secret).
    pub fn p256_ephemeral(seed: &[u8; 32]) -> (Vec<u8>, [u8; 32]) {
        use p256::{ecdh, SecretKey};
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let ephemeral = SecretKey::from_slice(seed).unwrap();
        let recipient = SecretKey::from_slice(&P256_SEED).unwrap().public_key();
        let point = ephemeral.public_key().to_encoded_point(false).as_bytes().to_vec();
        let shared =
            ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        (point, out)
    }

    /// Sender side of ECIES-X25519.
    pub fn x25519_ephemeral(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        use x25519_dalek::{PublicKey, StaticSecret};
        let ephemeral = StaticSecret::from(*seed);
        let recipient = PublicKey::from(&StaticSecret::from(X25519_SEED));
        let point = *PublicKey::from(&ephemeral).as_bytes();
        let shared = *ephemeral.diffie_hellman(&recipient).as_bytes();
        (point, shared)
    }
}
