//! Salted XOR cookie encoding for session key material.
//!
//! A secure string packs two 32-byte keys behind a 24-byte random salt and
//! folds the first 17 bytes over the rest. This is obfuscation, not
//! encryption: anyone holding the cookie can reverse it. The server decodes
//! the same layout, so changing it breaks existing sessions.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Salt prefix length.
pub const SALT_LEN: usize = 24;

/// Decoded length: salt followed by two 32-byte keys.
pub const ENCODED_LEN: usize = SALT_LEN + 32 + 32;

/// Width of the XOR window taken from the start of the buffer.
const FOLD: usize = 17;

/// Encodes two keys into a URL-safe cookie value.
///
/// # Examples
///
/// ```
/// use niu_common::secure_string::{decode_secure_string, encode_secure_string};
///
/// let encoded = encode_secure_string(&[1u8; 32], &[2u8; 32]);
/// assert_eq!(decode_secure_string(&encoded), Some(([1u8; 32], [2u8; 32])));
/// ```
#[must_use]
pub fn encode_secure_string(a: &[u8; 32], b: &[u8; 32]) -> String {
    let mut buf = [0u8; ENCODED_LEN];
    rand::rngs::OsRng.fill_bytes(&mut buf[..SALT_LEN]);
    buf[SALT_LEN..SALT_LEN + 32].copy_from_slice(a);
    buf[SALT_LEN + 32..].copy_from_slice(b);
    fold(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Decodes a cookie value produced by [`encode_secure_string`].
///
/// Returns `None` unless the input is valid URL-safe base64 of exactly
/// [`ENCODED_LEN`] bytes.
#[must_use]
pub fn decode_secure_string(encoded: &str) -> Option<([u8; 32], [u8; 32])> {
    let raw = URL_SAFE_NO_PAD
        .decode(encoded.trim().trim_end_matches('='))
        .ok()?;
    let mut buf: [u8; ENCODED_LEN] = raw.try_into().ok()?;
    // bytes below FOLD are never modified, so the same pass undoes itself
    fold(&mut buf);
    let a = buf[SALT_LEN..SALT_LEN + 32].try_into().ok()?;
    let b = buf[SALT_LEN + 32..].try_into().ok()?;
    Some((a, b))
}

fn fold(buf: &mut [u8]) {
    for i in FOLD..buf.len() {
        buf[i] ^= buf[i % FOLD];
    }
}
