//! AES key wrap (RFC 3394) unwrapping.

use aes::{Aes128, Aes256};
use aes_kw::Kek;

use crate::error::{Error, Result};

/// Unwraps an RFC 3394 blob with a 128- or 256-bit key-encryption key,
/// selected by the KEK length. Returns the recovered key length.
pub fn unwrap(kek: &[u8], wrapped: &[u8], out: &mut [u8]) -> Result<usize> {
    if wrapped.len() < 16 || wrapped.len() % 8 != 0 {
        return Err(Error::BadImage);
    }
    let plain_len = wrapped.len() - 8;
    if plain_len > out.len() {
        return Err(Error::BadImage);
    }
    match kek.len() {
        16 => {
            let mut key = [0u8; 16];
            key.copy_from_slice(kek);
            Kek::<Aes128>::from(key)
                .unwrap(wrapped, &mut out[..plain_len])
                .map_err(|_| Error::BadImage)?;
        }
        32 => {
            let mut key = [0u8; 32];
            key.copy_from_slice(kek);
            Kek::<Aes256>::from(key)
                .unwrap(wrapped, &mut out[..plain_len])
                .map_err(|_| Error::BadImage)?;
        }
        _ => return Err(Error::BadState("bad KEK length")),
    }
    Ok(plain_len)
}
