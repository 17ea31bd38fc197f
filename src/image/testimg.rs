//! Test-side image factory: builds signed (optionally encrypted) images in
//! the exact on-flash format, the way the signing tool would.

use crate::crypto::{ecdsa, ed25519, rsa};
use crate::enc::{testwrap, ImageCipher, UnwrapKind};
use crate::image::signature::SignatureKind;
use crate::image::{flags, tlv, AesKind, ImageHeader, Version, IMAGE_MAGIC};
use crate::keys::{KeyStore, SignKey};

use sha2::{Digest, Sha256};

/// The symmetric key sealed into every encrypted test image.
pub const IMAGE_KEY: [u8; 16] = [0x5a; 16];

/// How the image names its signing key.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum KeyNaming {
    Hash,
    PubKey,
    Id(u32),
}

pub struct ImageBuilder {
    pub version: Version,
    pub payload: Vec<u8>,
    pub sig: SignatureKind,
    pub naming: KeyNaming,
    pub sec_cnt: Option<u32>,
    pub encrypt: Option<UnwrapKind>,
    pub protected_extra: Vec<(u16, Vec<u8>)>,
    pub unprotected_extra: Vec<(u16, Vec<u8>)>,
    pub corrupt_signature: bool,
    pub corrupt_hash: bool,
}

impl ImageBuilder {
    pub fn new(version: Version) -> Self {
        ImageBuilder {
            version,
            payload: (0u32..800).map(|i| (i.wrapping_mul(31) % 251) as u8).collect(),
            sig: SignatureKind::EcdsaP256,
            naming: KeyNaming::Hash,
            sec_cnt: None,
            encrypt: None,
            protected_extra: Vec::new(),
            unprotected_extra: Vec::new(),
            corrupt_signature: false,
            corrupt_hash: false,
        }
    }

    pub fn payload_len(mut self, len: usize) -> Self {
        self.payload = (0..len).map(|i| ((i * 7 + 3) % 253) as u8).collect();
        self
    }

    pub fn sec_cnt(mut self, value: u32) -> Self {
        self.sec_cnt = Some(value);
        self
    }

    pub fn signed_with(mut self, sig: SignatureKind) -> Self {
        self.sig = sig;
        self
    }

    pub fn named_by(mut self, naming: KeyNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn encrypted(mut self, kind: UnwrapKind) -> Self {
        self.encrypt = Some(kind);
        self
    }

    pub fn corrupt_signature(mut self) -> Self {
        self.corrupt_signature = true;
        self
    }

    pub fn corrupt_hash(mut self) -> Self {
        self.corrupt_hash = true;
        self
    }

    /// The key table entry matching [`ImageBuilder::sig`].
    pub fn key_material(sig: SignatureKind) -> Vec<u8> {
        match sig {
            SignatureKind::EcdsaP256 => ecdsa::testkeys::public_key(),
            SignatureKind::Rsa2048Pss | SignatureKind::Rsa3072Pss => {
                rsa::testkeys::public_key_der()
            }
            SignatureKind::Ed25519 | SignatureKind::Ed25519Pure => {
                ed25519::testkeys::public_key()
            }
        }
    }

    fn sign(sig: SignatureKind, message: &[u8]) -> Vec<u8> {
        match sig {
            SignatureKind::EcdsaP256 => ecdsa::testkeys::sign_digest(message),
            SignatureKind::Rsa2048Pss | SignatureKind::Rsa3072Pss => {
                rsa::testkeys::sign_digest(message)
            }
            SignatureKind::Ed25519 | SignatureKind::Ed25519Pure => {
                ed25519::testkeys::sign(message)
            }
        }
    }

    /// Full on-flash image bytes.
    pub fn build(&self) -> Vec<u8> {
        let mut protected: Vec<(u16, Vec<u8>)> = Vec::new();
        if let Some(cnt) = self.sec_cnt {
            protected.push((tlv::SEC_CNT, cnt.to_le_bytes().to_vec()));
        }
        protected.extend(self.protected_extra.iter().cloned());
        let prot_total: usize = if protected.is_empty() {
            0
        } else {
            4 + protected.iter().map(|(_, v)| 4 + v.len()).sum::<usize>()
        };

        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            load_addr: 0,
            hdr_size: 32,
            protect_tlv_size: prot_total as u16,
            img_size: self.payload.len() as u32,
            flags: if self.encrypt.is_some() { flags::ENCRYPTED_AES128 } else { 0 },
            version: self.version,
        };

        // hash and signature always cover the plaintext form
        let mut plain = header.to_bytes().to_vec();
        plain.extend_from_slice(&self.payload);
        if !protected.is_empty() {
            plain.extend_from_slice(&tlv::PROT_INFO_MAGIC.to_le_bytes());
            plain.extend_from_slice(&(prot_total as u16).to_le_bytes());
            for (kind, value) in &protected {
                plain.extend_from_slice(&kind.to_le_bytes());
                plain.extend_from_slice(&(value.len() as u16).to_le_bytes());
                plain.extend_from_slice(value);
            }
        }

        let mut unprotected: Vec<(u16, Vec<u8>)> = Vec::new();
        if self.sig == SignatureKind::Ed25519Pure {
            unprotected.push((tlv::SIG_PURE, vec![1]));
        } else {
            let mut digest = Sha256::digest(&plain).to_vec();
            if self.corrupt_hash {
                digest[0] ^= 0x01;
            }
            unprotected.push((tlv::SHA256, digest));
        }

        let key_material = Self::key_material(self.sig);
        match self.naming {
            KeyNaming::Hash => {
                unprotected.push((tlv::KEYHASH, Sha256::digest(&key_material).to_vec()))
            }
            KeyNaming::PubKey => unprotected.push((tlv::PUBKEY, key_material.clone())),
            KeyNaming::Id(id) => unprotected.push((tlv::KEYID, id.to_le_bytes().to_vec())),
        }

        let message = if self.sig == SignatureKind::Ed25519Pure {
            plain.clone()
        } else {
            Sha256::digest(&plain).to_vec()
        };
        let mut signature = Self::sign(self.sig, &message);
        if self.corrupt_signature {
            let last = signature.len() - 1;
            signature[last] ^= 0x01;
        }
        unprotected.push((self.sig.sig_tlv(), signature));

        if let Some(kind) = self.encrypt {
            unprotected.push((kind.tlv_kind(), testwrap::wrap(kind, &IMAGE_KEY)));
        }
        unprotected.extend(self.unprotected_extra.iter().cloned());

        let unprot_total = 4 + unprotected.iter().map(|(_, v)| 4 + v.len()).sum::<usize>();

        let mut image = plain;
        if self.encrypt.is_some() {
            let cipher = ImageCipher::new(&IMAGE_KEY, AesKind::Aes128);
            let payload = &mut image[32..32 + self.payload.len()];
            cipher.encrypt(0, payload);
        }
        image.extend_from_slice(&tlv::INFO_MAGIC.to_le_bytes());
        image.extend_from_slice(&(unprot_total as u16).to_le_bytes());
        for (kind, value) in &unprotected {
            image.extend_from_slice(&kind.to_le_bytes());
            image.extend_from_slice(&(value.len() as u16).to_le_bytes());
            image.extend_from_slice(value);
        }
        image
    }

    pub fn header(&self) -> ImageHeader {
        let bytes = self.build();
        ImageHeader::parse(bytes[..32].try_into().unwrap())
    }
}

/// A one-entry key store over leaked material, convenient for tests.
pub fn store_for(sig: SignatureKind) -> KeyStore<'static> {
    store_with(sig, None, true)
}

pub fn store_with(sig: SignatureKind, id: Option<u32>, must_sign: bool) -> KeyStore<'static> {
    let material: &'static [u8] = Box::leak(ImageBuilder::key_material(sig).into_boxed_slice());
    let keys: &'static [SignKey<'static>] =
        Box::leak(Box::new([SignKey { material, id, must_sign }]));
    KeyStore::new(keys)
}
