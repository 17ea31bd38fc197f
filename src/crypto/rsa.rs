//! RSA-PSS verification and RSA-OAEP key recovery.
//!
//! The one backend in this crate that allocates: big-integer arithmetic in
//! the `rsa` crate needs a heap, exactly as the original needs an mbedTLS
//! heap when RSA is selected.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::hardened::Verdict;

/// Verifies an RSA-PSS (SHA-256, salt = digest length) signature over a
/// precomputed digest. 2048 and 3072 bit keys are told apart by the key
/// itself. Accepts PKCS#1 or SubjectPublicKeyInfo key documents.
pub fn verify_pss(key: &[u8], digest: &[u8], signature: &[u8]) -> Verdict {
    let key = match parse_public(key) {
        Some(key) => key,
        None => return Verdict::fail(),
    };
    Verdict::from_bool(key.verify(Pss::new::<Sha256>(), digest, signature).is_ok())
}

fn parse_public(key: &[u8]) -> Option<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(key)
        .ok()
        .or_else(|| RsaPublicKey::from_public_key_der(key).ok())
}

/// Recovers an image key from an RSA-OAEP (SHA-256) wrapped blob using the
/// device private key in PKCS#8 DER form. Returns the recovered length.
pub fn oaep_unwrap(private_key: &[u8], wrapped: &[u8], out: &mut [u8]) -> Result<usize> {
    let key = RsaPrivateKey::from_pkcs8_der(private_key)
        .map_err(|_| Error::BadState("bad RSA private key"))?;
    let plain =
        key.decrypt(Oaep::new::<Sha256>(), wrapped).map_err(|_| Error::BadImage)?;
    if plain.len() > out.len() {
        return Err(Error::BadImage);
    }
    out[..plain.len()].copy_from_slice(&plain);
    Ok(plain.len())
}
