//! Key material baked into (or bound to) the bootloader.
//!
//! Verification keys live in a table the port supplies; images name the key
//! they were signed with through a KEYHASH, PUBKEY or KEYID record. The
//! image-decryption private key is a single per-device secret.

use sha2::{Digest, Sha256};

use crate::hardened;

/// One entry of the verification key table.
#[derive(Copy, Clone)]
pub struct SignKey<'a> {
    /// Encoded public key: SEC1 point (ECDSA), raw 32 bytes (Ed25519) or
    /// PKCS#1 DER (RSA). Hashed as stored for KEYHASH matching.
    pub material: &'a [u8],
    /// Builtin key identifier, when the platform binds keys by id.
    pub id: Option<u32>,
    /// Whether validation must see a valid signature from this key.
    pub must_sign: bool,
}

/// The verification key table.
#[derive(Copy, Clone)]
pub struct KeyStore<'a> {
    keys: &'a [SignKey<'a>],
}

impl<'a> KeyStore<'a> {
    pub fn new(keys: &'a [SignKey<'a>]) -> Self {
        KeyStore { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> &SignKey<'a> {
        &self.keys[index]
    }

    /// Index of the key whose SHA-256 equals `hash`. The comparison is
    /// fault-hardened; a glitched mismatch cannot select a key.
    pub fn find_by_hash(&self, hash: &[u8]) -> Option<usize> {
        self.keys.iter().position(|key| {
            let digest = Sha256::digest(key.material);
            hardened::memequal(&digest, hash).is_pass()
        })
    }

    /// Index of the key carrying builtin identifier `id`.
    pub fn find_by_id(&self, id: u32) -> Option<usize> {
        self.keys.iter().position(|key| key.id == Some(id))
    }

    /// How many keys insist on signing every image.
    pub fn must_sign_count(&self) -> usize {
        self.keys.iter().filter(|key| key.must_sign).count()
    }
}

/// The device private key used to unwrap image encryption keys. The variant
/// must agree with the active unwrap algorithm.
#[derive(Copy, Clone)]
pub enum EncPrivateKey<'a> {
    /// P-256 scalar, PKCS#8 DER or raw 32 bytes.
    P256(&'a [u8]),
    /// X25519 scalar.
    X25519(&'a [u8; 32]),
    /// AES key-encryption key, 16 or 32 bytes.
    Kek(&'a [u8]),
    /// RSA private key, PKCS#8 DER.
    Rsa(&'a [u8]),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyhash_lookup_selects_the_matching_entry() {
        let keys = [
            SignKey { material: b"key zero", id: None, must_sign: false },
            SignKey { material: b"key one", id: Some(7), must_sign: true },
        ];
        let store = KeyStore::new(&keys);
        let hash = Sha256::digest(b"key one");
        assert_eq!(store.find_by_hash(&hash), Some(1));
        assert_eq!(store.find_by_hash(&[0u8; 32]), None);
        assert_eq!(store.find_by_id(7), Some(1));
        assert_eq!(store.find_by_id(8), None);
        assert_eq!(store.must_sign_count(), 1);
    }
}
