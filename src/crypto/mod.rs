//! Thin adapters over the crypto crates.
//!
//! Each submodule wraps exactly the verbs the boot path consumes: parse a
//! key, verify a signature over a digest, recover a shared secret, unwrap a
//! key. Signature checks return a hardened
//! [`Verdict`](crate::hardened::Verdict) rather than a bare bool.

pub mod ecdsa;
pub mod ecies;
pub mod ed25519;
pub mod keywrap;
pub mod rsa;
