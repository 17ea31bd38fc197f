//! Signature kinds and key selection.
//!
//! One signature kind is active per build; the image must carry a signature
//! of that kind from a key the bootloader knows. Keys are named by a
//! KEYHASH record (SHA-256 of the stored key), a full PUBKEY record
//! (hardware-bound hash comparison) or a builtin KEYID.

use sha2::Digest;

use crate::crypto;
use crate::hardened::Verdict;
use crate::image::hash::DigestKind;
use crate::image::tlv;
use crate::keys::KeyStore;

/// Largest signature value across the supported kinds (RSA-3072).
pub const SIG_BUF_LEN: usize = 384;

/// Largest key-naming TLV value: a full RSA-3072 public key document with
/// slack for DER framing and the public exponent.
pub const KEY_TLV_BUF_LEN: usize = SIG_BUF_LEN + 24;

/// The signature algorithms an image may be sealed with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignatureKind {
    EcdsaP256,
    Rsa2048Pss,
    Rsa3072Pss,
    Ed25519,
    /// Ed25519 over the full message; no hash TLV, SIG_PURE marker present.
    Ed25519Pure,
}

impl SignatureKind {
    /// The TLV record type carrying this signature.
    pub fn sig_tlv(self) -> u16 {
        match self {
            SignatureKind::EcdsaP256 => tlv::ECDSA_SIG,
            SignatureKind::Rsa2048Pss => tlv::RSA2048_PSS,
            SignatureKind::Rsa3072Pss => tlv::RSA3072_PSS,
            SignatureKind::Ed25519 | SignatureKind::Ed25519Pure => tlv::ED25519,
        }
    }

    /// The digest sealed into the image, absent for the pure kind, which
    /// hashes nothing and signs the message itself.
    pub fn digest_kind(self) -> Option<DigestKind> {
        match self {
            SignatureKind::Ed25519Pure => None,
            SignatureKind::Ed25519 => Some(DigestKind::Sha256),
            SignatureKind::EcdsaP256 => Some(DigestKind::Sha256),
            SignatureKind::Rsa2048Pss | SignatureKind::Rsa3072Pss => Some(DigestKind::Sha256),
        }
    }

    /// Structural acceptance of a signature length before buffering it.
    pub fn len_acceptable(self, len: usize) -> bool {
        match self {
            // ASN.1 framing varies; the DER parser is the real gate
            SignatureKind::EcdsaP256 => len <= 80,
            SignatureKind::Rsa2048Pss => len == 256,
            SignatureKind::Rsa3072Pss => len == 384,
            SignatureKind::Ed25519 | SignatureKind::Ed25519Pure => len == 64,
        }
    }

    /// Verifies `signature` over `message` (the image digest, or the whole
    /// signed region for the pure kind) with the given stored key.
    pub fn verify(self, key: &[u8], message: &[u8], signature: &[u8]) -> Verdict {
        match self {
            SignatureKind::EcdsaP256 => crypto::ecdsa::verify(key, message, signature),
            SignatureKind::Rsa2048Pss | SignatureKind::Rsa3072Pss => {
                crypto::rsa::verify_pss(key, message, signature)
            }
            SignatureKind::Ed25519 | SignatureKind::Ed25519Pure => {
                crypto::ed25519::verify(key, message, signature)
            }
        }
    }
}

/// Maps a key-naming TLV to an index in the key table, or `None` when the
/// key is unknown (acceptable: other keys may still sign the image).
pub fn locate_key(store: &KeyStore, kind: u16, value: &[u8]) -> Option<usize> {
    match kind {
        tlv::KEYHASH => store.find_by_hash(value),
        tlv::PUBKEY => {
            // hardware-bound model: the image carries the whole key and the
            // device retains its hash; comparing hashes selects the entry
            let digest = sha2::Sha256::digest(value);
            store.find_by_hash(&digest)
        }
        tlv::KEYID => {
            let id: [u8; 4] = value.try_into().ok()?;
            store.find_by_id(u32::from_le_bytes(id))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecdsa::testkeys;
    use crate::keys::SignKey;
    use sha2::Sha256;

    #[test]
    fn key_naming_records_select_table_entries() {
        let material = testkeys::public_key();
        let keys = [SignKey { material: &material, id: Some(3), must_sign: true }];
        let store = KeyStore::new(&keys);

        let hash = Sha256::digest(&material);
        assert_eq!(locate_key(&store, tlv::KEYHASH, &hash), Some(0));
        assert_eq!(locate_key(&store, tlv::PUBKEY, &material), Some(0));
        assert_eq!(locate_key(&store, tlv::KEYID, &3u32.to_le_bytes()), Some(0));
        assert_eq!(locate_key(&store, tlv::KEYID, &4u32.to_le_bytes()), None);
        assert_eq!(locate_key(&store, tlv::KEYHASH, &[0u8; 32]), None);
    }

    #[test]
    fn length_gates_match_the_kinds() {
        assert!(SignatureKind::EcdsaP256.len_acceptable(71));
        assert!(!SignatureKind::EcdsaP256.len_acceptable(100));
        assert!(SignatureKind::Rsa2048Pss.len_acceptable(256));
        assert!(!SignatureKind::Rsa2048Pss.len_acceptable(255));
        assert!(SignatureKind::Ed25519.len_acceptable(64));
    }

    #[test]
    fn pure_kind_carries_no_digest() {
        assert_eq!(SignatureKind::Ed25519Pure.digest_kind(), None);
        assert_eq!(
            SignatureKind::EcdsaP256.digest_kind(),
            Some(crate::image::hash::DigestKind::Sha256)
        );
    }
}
