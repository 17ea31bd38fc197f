//! Ed25519 signature verification.
//!
//! Two uses: the ordinary mode signs the image digest as its message; the
//! pure mode signs the whole of header + payload + protected TLVs and
//! carries no hash TLV at all.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::hardened::Verdict;

/// Verifies an Ed25519 signature. `message` is either the image digest or,
/// in pure mode, the full signed region.
pub fn verify(key: &[u8], message: &[u8], signature: &[u8]) -> Verdict {
    let key: &[u8; 32] = match key.try_into() {
        Ok(key) => key,
        Err(_) => return Verdict::fail(),
    };
    let key = match VerifyingKey::from_bytes(key) {
        Ok(key) => key,
        Err(_) => return Verdict::fail(),
    };
    let signature = match Signature::from_slice(signature) {
        Ok(signature) => signature,
        Err(_) => return Verdict::fail(),
    };
    Verdict::from_bool(key.verify(message, &signature).is_ok())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_signature() {
        let signature = testkeys::sign(b"full image bytes");
        assert!(verify(&testkeys::public_key(), b"full image bytes", &signature).is_pass());
        assert!(!verify(&testkeys::public_key(), b"other bytes", &signature).is_pass());
    }

    #[test]
    fn rejects_malformed_inputs() {
        assert!(!verify(&[0u8; 31], b"m", &[0u8; 64]).is_pass());
        assert!(!verify(&testkeys::public_key(), b"m", &[0u8; 63]).is_pass());
    }
}
