//! Core type definitions and wire constants shared by the HTTP pipeline and
//! the packet socket.

/// A 32-byte public key (Ed25519 verifying key or X25519 public key).
pub type PublicKey = [u8; 32];

/// Platform identifier sent with every signed request.
pub const DEFAULT_PLATFORM: &str = "8";

/// Signed request/response header names.
pub mod header {
    /// Unix timestamp (seconds) the message was signed at.
    pub const TIMESTAMP: &str = "x-timestamp";
    /// Per-message random nonce (UUID without hyphens).
    pub const NONCE: &str = "x-nonce";
    /// Base64 Ed25519 signature over the canonical signing payload.
    pub const SIGNATURE: &str = "x-signature";
    /// Platform identifier.
    pub const PLATFORM: &str = "x-platform";
    /// Session identifier (obfuscated public keys of the session).
    pub const SESSION: &str = "x-session";
    /// Original content type of an encrypted body.
    pub const ORIGIN_CONTENT_TYPE: &str = "x-content-type";
}

/// Content types understood by the pipeline.
pub mod content_type {
    /// Body is a base64 sealed envelope.
    pub const ENCRYPTED: &str = "application/x-encrypted;charset=utf-8";
    /// Plain JSON body.
    pub const JSON: &str = "application/json";
}

/// Default cookie names.
pub mod cookie {
    /// Session id cookie: obfuscated signing + encryption public keys.
    pub const SESSION_ID: &str = "sid";
    /// Client key cookie: obfuscated signing + encryption private keys.
    pub const CLIENT_KEY: &str = "cid";
    /// Long-lived client identifier (32 hex chars).
    pub const CLIENT_ID: &str = "cli";
    /// Platform marker cookie.
    pub const PLATFORM: &str = "pla";
    /// Access token cookie.
    pub const ACCESS_TOKEN: &str = "access_token";
    /// Refresh token cookie.
    pub const REFRESH_TOKEN: &str = "refresh_token";
}

/// WebSocket close codes.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Abnormal closure (no close frame received).
    pub const ABNORMAL: u16 = 1006;

    /// Codes 1000–1003 signal an intentional shutdown that must not be
    /// followed by a reconnect.
    #[must_use]
    pub const fn is_clean(code: u16) -> bool {
        matches!(code, 1000..=1003)
    }
}

/// Packet message types.
pub mod msg_type {
    /// Keepalive request.
    pub const PING: u16 = 0x0001;
    /// Keepalive response.
    pub const PONG: u16 = 0x0002;
}

/// Response codes carried in JSON response envelopes.
pub mod resp_code {
    /// Request succeeded.
    pub const SUCCEED: &str = "succeed";
    /// Arguments failed validation.
    pub const INVALID_ARGS: &str = "invalid_args";
    /// Phone number is invalid.
    pub const INVALID_PHONE: &str = "invalid_phone";
    /// SMS code is invalid.
    pub const INVALID_MSG_CODE: &str = "invalid_msg_code";
    /// Secure code is invalid.
    pub const INVALID_SECURE_CODE: &str = "invalid_secure_code";
    /// Generic failure.
    pub const FAIL: &str = "fail";
}
