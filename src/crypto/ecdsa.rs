//! ECDSA-P256 signature verification.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;

use crate::hardened::Verdict;

/// Verifies an ASN.1 DER encoded ECDSA-P256 signature over a precomputed
/// digest. The key may be a SubjectPublicKeyInfo document or a raw SEC1
/// point.
pub fn verify(key: &[u8], digest: &[u8], signature: &[u8]) -> Verdict {
    let key = match parse_key(key) {
        Some(key) => key,
        None => return Verdict::fail(),
    };
    let signature = match Signature::from_der(signature) {
        Ok(signature) => signature,
        Err(_) => return Verdict::fail(),
    };
    Verdict::from_bool(key.verify_prehash(digest, &signature).is_ok())
}

fn parse_key(key: &[u8]) -> Option<VerifyingKey> {
    VerifyingKey::from_public_key_der(key)
        .ok()
        .or_else(|| VerifyingKey::from_sec1_bytes(key).ok())
}
