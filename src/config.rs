//! Compile-time capacities and build-time backend selection.
//!
//! Capacities are upper bounds on statically sized buffers; the actual image
//! count and flash geometry are runtime configuration handed to the
//! [`Bootloader`](crate::Bootloader) constructor. Backends (signature kind,
//! key-unwrap kind, swap strategy) are sum types whose single active case is
//! chosen here by cargo feature; every case stays compiled so the host test
//! suite covers the whole matrix.

use static_assertions::const_assert;

use crate::enc::UnwrapKind;
use crate::image::signature::SignatureKind;
use crate::swap::SwapPolicy;

/// Upper bound on simultaneously managed image pairs.
pub const MAX_IMAGES: usize = 2;

/// Upper bound on sectors per slot, which also sizes the swap status area.
pub const MAX_IMAGE_SECTORS: usize = 128;

/// Largest supported flash write block. Sizes trailer write buffers.
pub const MAX_WRITE_ALIGN: usize = 32;

/// Chunk size for streaming reads on the boot path (hashing, copying with
/// re-encryption, erased-region checks).
pub const SCRATCH_BUF_SIZE: usize = 256;

const_assert!(MAX_WRITE_ALIGN >= 8);
const_assert!(SCRATCH_BUF_SIZE % MAX_WRITE_ALIGN == 0);

#[cfg(all(feature = "sig-ecdsa", feature = "sig-rsa"))]
compile_error!("enable only one signature backend");
#[cfg(all(feature = "sig-ecdsa", feature = "sig-ed25519"))]
compile_error!("enable only one signature backend");
#[cfg(all(feature = "sig-rsa", feature = "sig-ed25519"))]
compile_error!("enable only one signature backend");

/// The signature kind the boot driver demands of every image.
pub const ACTIVE_SIGNATURE: SignatureKind = {
    #[cfg(feature = "sig-ecdsa")]
    {
        SignatureKind::EcdsaP256
    }
    #[cfg(all(feature = "sig-rsa", not(feature = "sig-ecdsa")))]
    {
        SignatureKind::Rsa2048Pss
    }
    #[cfg(all(
        feature = "sig-ed25519",
        not(feature = "sig-pure"),
        not(any(feature = "sig-ecdsa", feature = "sig-rsa"))
    ))]
    {
        SignatureKind::Ed25519
    }
    #[cfg(all(
        feature = "sig-ed25519",
        feature = "sig-pure",
        not(any(feature = "sig-ecdsa", feature = "sig-rsa"))
    ))]
    {
        SignatureKind::Ed25519Pure
    }
    #[cfg(not(any(feature = "sig-ecdsa", feature = "sig-rsa", feature = "sig-ed25519")))]
    {
        SignatureKind::EcdsaP256
    }
};

#[cfg(all(feature = "enc-ec256", feature = "enc-x25519"))]
compile_error!("enable only one key-unwrap backend");
#[cfg(all(feature = "enc-ec256", feature = "enc-kw"))]
compile_error!("enable only one key-unwrap backend");
#[cfg(all(feature = "enc-ec256", feature = "enc-rsa"))]
compile_error!("enable only one key-unwrap backend");

/// The key-unwrap algorithm expected for encrypted images.
pub const ACTIVE_UNWRAP: UnwrapKind = {
    #[cfg(feature = "enc-ec256")]
    {
        UnwrapKind::EciesP256
    }
    #[cfg(all(feature = "enc-x25519", not(feature = "enc-ec256")))]
    {
        UnwrapKind::EciesX25519
    }
    #[cfg(all(
        feature = "enc-kw",
        not(any(feature = "enc-ec256", feature = "enc-x25519"))
    ))]
    {
        UnwrapKind::AesKeyWrap
    }
    #[cfg(all(
        feature = "enc-rsa",
        not(any(feature = "enc-ec256", feature = "enc-x25519", feature = "enc-kw"))
    ))]
    {
        UnwrapKind::RsaOaep
    }
    #[cfg(not(any(
        feature = "enc-ec256",
        feature = "enc-x25519",
        feature = "enc-kw",
        feature = "enc-rsa"
    )))]
    {
        UnwrapKind::EciesP256
    }
};

#[cfg(all(feature = "swap-scratch", feature = "swap-move"))]
compile_error!("enable only one swap strategy");
#[cfg(all(feature = "swap-scratch", feature = "swap-offset"))]
compile_error!("enable only one swap strategy");
#[cfg(all(feature = "swap-scratch", feature = "overwrite-only"))]
compile_error!("enable only one swap strategy");

/// The upgrade strategy the boot driver runs.
pub const ACTIVE_SWAP: SwapPolicy = {
    #[cfg(feature = "swap-scratch")]
    {
        SwapPolicy::Scratch
    }
    #[cfg(all(feature = "swap-move", not(feature = "swap-scratch")))]
    {
        SwapPolicy::Slide
    }
    #[cfg(all(
        feature = "swap-offset",
        not(any(feature = "swap-scratch", feature = "swap-move"))
    ))]
    {
        SwapPolicy::Offset
    }
    #[cfg(all(
        feature = "overwrite-only",
        not(any(feature = "swap-scratch", feature = "swap-move", feature = "swap-offset"))
    ))]
    {
        SwapPolicy::Overwrite
    }
    #[cfg(not(any(
        feature = "swap-scratch",
        feature = "swap-move",
        feature = "swap-offset",
        feature = "overwrite-only"
    )))]
    {
        SwapPolicy::Scratch
    }
};

/// Whether primary-slot validation results are cached in the trailing magic
/// bytes, which shrinks the permitted image size by that reservation.
pub const VALIDATE_PRIMARY_ONCE: bool = cfg!(feature = "validate-primary-once");
