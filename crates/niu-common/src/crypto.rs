//! Cryptographic primitives for signed and sealed HTTP messages.
//!
//! Provides Ed25519 detached signatures over canonical signing strings, and
//! a box-style sealing primitive: an X25519 key agreement between a local
//! secret and a peer public key, stretched with HKDF-SHA256 into an
//! XChaCha20-Poly1305 key.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng as AeadRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
const TAG_LEN: usize = 16;

/// HKDF info string binding the derived key to this sealing scheme.
const BOX_INFO: &[u8] = b"niu-box-v1";

/// Errors from sealing, opening and key decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext shorter than nonce + tag.
    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),
    /// Authentication tag did not verify.
    #[error("decryption failed")]
    Open,
    /// Sealing failed.
    #[error("encryption failed")]
    Seal,
    /// Base64 input could not be decoded.
    #[error("invalid base64")]
    Base64,
    /// Key bytes are not a valid curve point.
    #[error("invalid public key")]
    InvalidKey,
    /// Key material had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    KeyLength {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },
}

/// Produces and checks detached signatures.
pub trait Signer {
    /// Signs `data`, returning the raw signature bytes.
    fn sign(&self, data: &[u8]) -> Vec<u8>;
    /// Verifies `signature` over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
    /// Length of a signature in bytes.
    fn signature_len(&self) -> usize;
}

/// Symmetric encryption capability.
pub trait Crypter {
    /// Encrypts `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Seal`] if the AEAD rejects the input.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    /// Decrypts `ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the input is truncated or fails
    /// authentication.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

impl Signer for SigningKey {
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        sign(self, data).to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        verify(&self.verifying_key(), data, signature)
    }

    fn signature_len(&self) -> usize {
        Signature::BYTE_SIZE
    }
}

/// An X25519 key pair used to derive sealing keys.
#[derive(Clone)]
pub struct BoxKeyPair {
    /// Private scalar.
    pub secret: StaticSecret,
    /// Matching public key.
    pub public: X25519Public,
}

impl BoxKeyPair {
    /// Rebuilds a key pair from its 32-byte private key.
    #[must_use]
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Private key bytes, wiped on drop.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Public key bytes.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

impl std::fmt::Debug for BoxKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxKeyPair")
            .field("public", &URL_SAFE_NO_PAD.encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Generates a fresh Ed25519 signing key using OS randomness.
#[must_use]
pub fn generate_sign_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Generates a fresh X25519 key pair using OS randomness.
#[must_use]
pub fn generate_box_keypair() -> BoxKeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    BoxKeyPair { secret, public }
}

/// Signs the UTF-8 bytes of `message`.
///
/// # Examples
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use niu_common::crypto;
///
/// let key = SigningKey::from_bytes(&[1u8; 32]);
/// let sig = crypto::sign(&key, b"nonce=abc&timestamp=1");
/// assert!(crypto::verify(&key.verifying_key(), b"nonce=abc&timestamp=1", &sig));
/// ```
#[must_use]
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; 64] {
    ed25519_dalek::Signer::sign(signing_key, message).to_bytes()
}

/// Verifies a detached signature. Malformed signatures yield `false`.
#[must_use]
pub fn verify(verifying_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    use ed25519_dalek::Verifier as _;
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &sig).is_ok()
}

/// Signs a canonical string and returns the signature as standard base64.
#[must_use]
pub fn sign_base64(signing_key: &SigningKey, message: &str) -> String {
    STANDARD.encode(sign(signing_key, message.as_bytes()))
}

/// Verifies a standard-base64 signature over a canonical string.
#[must_use]
pub fn verify_base64(verifying_key: &VerifyingKey, message: &str, signature: &str) -> bool {
    match STANDARD.decode(signature.trim()) {
        Ok(raw) => verify(verifying_key, message.as_bytes(), &raw),
        Err(_) => false,
    }
}

/// Decodes a base64 (standard or URL-safe) Ed25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError`] if the input is not base64, not 32 bytes, or not
/// a valid curve point.
pub fn verifying_key_from_base64(encoded: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = decode_key32(encoded)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidKey)
}

/// Decodes a base64 (standard or URL-safe) X25519 public key.
///
/// # Errors
///
/// Returns [`CryptoError`] if the input is not base64 or not 32 bytes.
pub fn box_public_from_base64(encoded: &str) -> Result<X25519Public, CryptoError> {
    decode_key32(encoded).map(X25519Public::from)
}

fn decode_key32(encoded: &str) -> Result<[u8; 32], CryptoError> {
    let trimmed = encoded.trim();
    let raw = STANDARD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
        .map_err(|_| CryptoError::Base64)?;
    let actual = raw.len();
    raw.try_into().map_err(|_| CryptoError::KeyLength {
        expected: 32,
        actual,
    })
}

/// Seals and opens messages between a local secret and a peer public key.
///
/// Both ends derive the same key, so a crypter built from
/// `(client_secret, server_public)` opens what one built from
/// `(server_secret, client_public)` sealed, and vice versa.
pub struct BoxCrypter {
    cipher: XChaCha20Poly1305,
}

impl BoxCrypter {
    /// Derives the shared sealing key.
    #[must_use]
    pub fn new(local: &StaticSecret, peer: &X25519Public) -> Self {
        let shared = local.diffie_hellman(peer);
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        // 32 bytes is always a valid HKDF-SHA256 output length
        let _ = hk.expand(BOX_INFO, &mut key[..]);
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key[..])),
        }
    }

    /// Encrypts and returns the sealed envelope as standard base64.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Seal`] if encryption fails.
    pub fn encrypt_to_base64(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        self.encrypt(plaintext).map(|sealed| STANDARD.encode(sealed))
    }

    /// Decodes a base64 envelope and decrypts it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] on invalid base64 or failed authentication.
    pub fn decrypt_base64(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = STANDARD
            .decode(envelope.trim())
            .map_err(|_| CryptoError::Base64)?;
        self.decrypt(&raw)
    }
}

impl Crypter for BoxCrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;
        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::TooShort(ciphertext.len()));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::Open)
    }
}

/// Returns a fresh request nonce: a v4 UUID without hyphens.
#[must_use]
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in milliseconds.
#[must_use]
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
