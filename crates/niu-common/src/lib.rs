//! Primitives shared by niu clients and test servers.
//!
//! This crate provides:
//! - Ed25519 signing and X25519 sealed boxes ([`crypto`])
//! - Canonical signing strings ([`canonical`])
//! - Salted cookie encoding for session keys ([`secure_string`])
//! - Binary packet framing for the socket ([`packet`])
//! - Wire constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod crypto;
pub mod packet;
pub mod secure_string;
pub mod types;

pub use crypto::CryptoError;
pub use packet::PacketError;
pub use types::PublicKey;
