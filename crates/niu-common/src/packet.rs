//! Binary packet framing for the persistent socket.
//!
//! Every packet starts with a fixed big-endian header followed by a
//! length-delimited payload encoded by a [`Marshaler`]:
//!
//! ```text
//! request:  msg_type u16 | request_id u32 | timestamp_ms u64 |           len u32 | payload
//! response: msg_type u16 | request_id u32 | timestamp_ms u64 | code u16 | len u32 | payload
//! ```
//!
//! An absent payload is encoded as `len = 0`.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::unix_now_millis;

/// Request header length in bytes.
pub const REQUEST_HEADER_LEN: usize = 2 + 4 + 8 + 4;

/// Response header length in bytes.
pub const RESPONSE_HEADER_LEN: usize = 2 + 4 + 8 + 2 + 4;

/// Maximum payload size in bytes (1 MiB).
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Request ids wrap modulo this value, matching the server's counter.
pub const REQUEST_ID_MODULUS: u32 = 0xFFFF_FFFF;

/// Errors that can occur while framing or parsing packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The input is shorter than the fixed header.
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The declared payload length disagrees with the bytes present.
    #[error("payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Bytes actually following the header.
        actual: usize,
    },
    /// The payload exceeds [`MAX_PAYLOAD`].
    #[error("payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Maximum allowed payload size.
        max: usize,
        /// Actual payload size.
        actual: usize,
    },
    /// The payload could not be encoded.
    #[error("payload encode failed: {0}")]
    Encode(String),
    /// The payload could not be decoded.
    #[error("payload decode failed: {0}")]
    Decode(String),
}

/// Converts payload values to and from bytes.
pub trait Marshaler: Send + Sync {
    /// Encodes `value`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Encode`] if serialization fails.
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, PacketError>;

    /// Decodes `bytes` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Decode`] if deserialization fails.
    fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, PacketError>;
}

/// MessagePack payloads with string map keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPack;

impl Marshaler for MsgPack {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, PacketError> {
        rmp_serde::to_vec_named(value).map_err(|e| PacketError::Encode(e.to_string()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, PacketError> {
        rmp_serde::from_slice(bytes).map_err(|e| PacketError::Decode(e.to_string()))
    }
}

/// JSON payloads, mostly useful for debugging against text tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Marshaler for Json {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(value).map_err(|e| PacketError::Encode(e.to_string()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, PacketError> {
        serde_json::from_slice(bytes).map_err(|e| PacketError::Decode(e.to_string()))
    }
}

/// Fixed header of a request packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Message type.
    pub msg_type: u16,
    /// Correlation id.
    pub request_id: u32,
    /// Sender clock, Unix milliseconds.
    pub timestamp: u64,
}

/// Fixed header of a response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Message type.
    pub msg_type: u16,
    /// Id of the request this answers (or 0 for server pushes).
    pub request_id: u32,
    /// Server clock, Unix milliseconds.
    pub timestamp: u64,
    /// Result code.
    pub code: u16,
}

/// A parsed request packet with its still-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    /// Header fields.
    pub meta: RequestMeta,
    /// Encoded payload, empty when absent.
    pub payload: Vec<u8>,
}

/// A parsed response packet with its still-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    /// Header fields.
    pub meta: ResponseMeta,
    /// Encoded payload, empty when absent.
    pub payload: Vec<u8>,
}

/// Encodes and decodes packets with payloads in a fixed format.
#[derive(Debug, Clone, Default)]
pub struct PacketProtocol<M = MsgPack> {
    marshaler: M,
}

impl PacketProtocol<MsgPack> {
    /// Protocol with MessagePack payloads.
    #[must_use]
    pub const fn msgpack() -> Self {
        Self { marshaler: MsgPack }
    }
}

impl<M: Marshaler> PacketProtocol<M> {
    /// Protocol using `marshaler` for payloads.
    pub const fn new(marshaler: M) -> Self {
        Self { marshaler }
    }

    /// Encodes a request stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the payload fails to encode or is too
    /// large.
    ///
    /// # Examples
    ///
    /// ```
    /// use niu_common::packet::{decode_request_meta, PacketProtocol};
    ///
    /// let proto = PacketProtocol::msgpack();
    /// let bytes = proto.encode_request::<()>(0x0001, 7, None).unwrap();
    /// let meta = decode_request_meta(&bytes).unwrap();
    /// assert_eq!((meta.msg_type, meta.request_id), (0x0001, 7));
    /// ```
    pub fn encode_request<T: Serialize + ?Sized>(
        &self,
        msg_type: u16,
        request_id: u32,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, PacketError> {
        let meta = RequestMeta {
            msg_type,
            request_id,
            timestamp: unix_now_millis(),
        };
        let body = self.encode_payload(payload)?;
        Ok(write_request(&meta, &body))
    }

    /// Encodes a response stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the payload fails to encode or is too
    /// large.
    pub fn encode_response<T: Serialize + ?Sized>(
        &self,
        msg_type: u16,
        request_id: u32,
        code: u16,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, PacketError> {
        let meta = ResponseMeta {
            msg_type,
            request_id,
            timestamp: unix_now_millis(),
            code,
        };
        let body = self.encode_payload(payload)?;
        Ok(write_response(&meta, &body))
    }

    /// Decodes a payload. An empty payload yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Decode`] if the bytes are not a valid `T`.
    pub fn decode_payload<T: DeserializeOwned>(
        &self,
        payload: &[u8],
    ) -> Result<Option<T>, PacketError> {
        if payload.is_empty() {
            return Ok(None);
        }
        self.marshaler.unmarshal(payload).map(Some)
    }

    fn encode_payload<T: Serialize + ?Sized>(
        &self,
        payload: Option<&T>,
    ) -> Result<Vec<u8>, PacketError> {
        let body = match payload {
            Some(value) => self.marshaler.marshal(value)?,
            None => Vec::new(),
        };
        if body.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: body.len(),
            });
        }
        Ok(body)
    }
}

/// Writes a request header and raw payload.
#[must_use]
pub fn write_request(meta: &RequestMeta, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(REQUEST_HEADER_LEN + payload.len());
    v.extend_from_slice(&meta.msg_type.to_be_bytes());
    v.extend_from_slice(&meta.request_id.to_be_bytes());
    v.extend_from_slice(&meta.timestamp.to_be_bytes());
    v.extend_from_slice(&payload_len(payload).to_be_bytes());
    v.extend_from_slice(payload);
    v
}

/// Writes a response header and raw payload.
#[must_use]
pub fn write_response(meta: &ResponseMeta, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(RESPONSE_HEADER_LEN + payload.len());
    v.extend_from_slice(&meta.msg_type.to_be_bytes());
    v.extend_from_slice(&meta.request_id.to_be_bytes());
    v.extend_from_slice(&meta.timestamp.to_be_bytes());
    v.extend_from_slice(&meta.code.to_be_bytes());
    v.extend_from_slice(&payload_len(payload).to_be_bytes());
    v.extend_from_slice(payload);
    v
}

fn payload_len(payload: &[u8]) -> u32 {
    // payloads are capped at MAX_PAYLOAD well below u32::MAX
    u32::try_from(payload.len()).unwrap_or(u32::MAX)
}

/// Parses only the fixed header of a request.
///
/// # Errors
///
/// Returns [`PacketError::TooShort`] if the header is incomplete.
pub fn decode_request_meta(data: &[u8]) -> Result<RequestMeta, PacketError> {
    let mut r = Reader::new(data, REQUEST_HEADER_LEN)?;
    Ok(RequestMeta {
        msg_type: r.u16(),
        request_id: r.u32(),
        timestamp: r.u64(),
    })
}

/// Parses a full request packet.
///
/// # Errors
///
/// Returns [`PacketError`] if the header is incomplete or the declared
/// payload length does not match.
pub fn decode_request(data: &[u8]) -> Result<RequestPacket, PacketError> {
    let mut r = Reader::new(data, REQUEST_HEADER_LEN)?;
    let meta = RequestMeta {
        msg_type: r.u16(),
        request_id: r.u32(),
        timestamp: r.u64(),
    };
    let payload = r.payload()?;
    Ok(RequestPacket { meta, payload })
}

/// Parses only the fixed header of a response, leaving the payload
/// untouched so callers can dispatch before a full decode.
///
/// # Errors
///
/// Returns [`PacketError::TooShort`] if the header is incomplete.
///
/// # Examples
///
/// ```
/// use niu_common::packet::{decode_response_meta, write_response, ResponseMeta};
///
/// let meta = ResponseMeta { msg_type: 2, request_id: 9, timestamp: 1, code: 0 };
/// let bytes = write_response(&meta, &[]);
/// assert_eq!(decode_response_meta(&bytes).unwrap(), meta);
/// ```
pub fn decode_response_meta(data: &[u8]) -> Result<ResponseMeta, PacketError> {
    let mut r = Reader::new(data, RESPONSE_HEADER_LEN)?;
    Ok(ResponseMeta {
        msg_type: r.u16(),
        request_id: r.u32(),
        timestamp: r.u64(),
        code: r.u16(),
    })
}

/// Parses a full response packet.
///
/// # Errors
///
/// Returns [`PacketError`] if the header is incomplete or the declared
/// payload length does not match.
pub fn decode_response(data: &[u8]) -> Result<ResponsePacket, PacketError> {
    let mut r = Reader::new(data, RESPONSE_HEADER_LEN)?;
    let meta = ResponseMeta {
        msg_type: r.u16(),
        request_id: r.u32(),
        timestamp: r.u64(),
        code: r.u16(),
    };
    let payload = r.payload()?;
    Ok(ResponsePacket { meta, payload })
}

/// Cursor over a buffer whose header length has already been checked.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], header_len: usize) -> Result<Self, PacketError> {
        if data.len() < header_len {
            return Err(PacketError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }
        Ok(Self { data, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }

    fn payload(&mut self) -> Result<Vec<u8>, PacketError> {
        let declared = self.u32() as usize;
        let rest = &self.data[self.pos..];
        if declared > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: declared,
            });
        }
        if declared != rest.len() {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: rest.len(),
            });
        }
        Ok(rest.to_vec())
    }
}

/// Per-client request id counter.
///
/// The first id handed out is 1; after `0xFFFF_FFFE` the counter wraps to 0.
#[derive(Debug, Default)]
pub struct RequestIds {
    last: AtomicU32,
}

impl RequestIds {
    /// Counter whose next id is `last + 1` (mod [`REQUEST_ID_MODULUS`]).
    #[must_use]
    pub const fn starting_after(last: u32) -> Self {
        Self {
            last: AtomicU32::new(last),
        }
    }

    /// Advances and returns the next id.
    pub fn next_id(&self) -> u32 {
        let prev = self
            .last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(wrap_next(id)))
            .unwrap_or_else(|id| id);
        wrap_next(prev)
    }
}

const fn wrap_next(id: u32) -> u32 {
    if id >= REQUEST_ID_MODULUS - 1 {
        0
    } else {
        id + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        room: String,
        text: String,
    }

    #[test]
    fn request_header_layout_is_big_endian() {
        let meta = RequestMeta {
            msg_type: 0x0102,
            request_id: 0x0304_0506,
            timestamp: 0x0708_090A_0B0C_0D0E,
        };
        let bytes = write_request(&meta, b"xyz");
        assert_eq!(
            &bytes[..REQUEST_HEADER_LEN],
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 0, 0, 0, 3]
        );
        assert_eq!(&bytes[REQUEST_HEADER_LEN..], b"xyz");
    }

    #[test]
    fn response_header_carries_code_before_length() {
        let meta = ResponseMeta {
            msg_type: 2,
            request_id: 1,
            timestamp: 0,
            code: 0xBEEF,
        };
        let bytes = write_response(&meta, &[]);
        assert_eq!(bytes.len(), RESPONSE_HEADER_LEN);
        assert_eq!(&bytes[14..16], &[0xBE, 0xEF]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn absent_payload_encodes_as_zero_length() {
        let proto = PacketProtocol::msgpack();
        let bytes = proto.encode_request::<()>(1, 1, None).unwrap();
        assert_eq!(bytes.len(), REQUEST_HEADER_LEN);
        let packet = decode_request(&bytes).unwrap();
        assert!(packet.payload.is_empty());
        assert_eq!(proto.decode_payload::<Chat>(&packet.payload).unwrap(), None);
    }

    #[test]
    fn msgpack_payload_survives_request() {
        let proto = PacketProtocol::msgpack();
        let chat = Chat {
            room: "lobby".into(),
            text: "hi".into(),
        };
        let bytes = proto.encode_request(0x10, 42, Some(&chat)).unwrap();
        let packet = decode_request(&bytes).unwrap();
        assert_eq!(packet.meta.msg_type, 0x10);
        assert_eq!(packet.meta.request_id, 42);
        assert!(packet.meta.timestamp > 0);
        assert_eq!(proto.decode_payload(&packet.payload).unwrap(), Some(chat));
    }

    #[test]
    fn json_marshaler_is_interchangeable() {
        let proto = PacketProtocol::new(Json);
        let bytes = proto
            .encode_response(3, 9, 200, Some(&serde_json::json!({"ok": true})))
            .unwrap();
        let packet = decode_response(&bytes).unwrap();
        assert_eq!(packet.payload, br#"{"ok":true}"#);
        assert_eq!(packet.meta.code, 200);
    }

    #[test]
    fn response_meta_ignores_payload() {
        let proto = PacketProtocol::msgpack();
        let mut bytes = proto
            .encode_response(2, 5, 0, Some(&"payload"))
            .unwrap();
        // corrupt the payload; meta must still parse
        bytes.truncate(RESPONSE_HEADER_LEN + 1);
        let meta = decode_response_meta(&bytes).unwrap();
        assert_eq!((meta.msg_type, meta.request_id, meta.code), (2, 5, 0));
        assert!(matches!(
            decode_response(&bytes),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(
            decode_response_meta(&[0u8; 5]),
            Err(PacketError::TooShort {
                expected: RESPONSE_HEADER_LEN,
                actual: 5
            })
        );
        assert!(matches!(
            decode_request(&[]),
            Err(PacketError::TooShort { actual: 0, .. })
        ));
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let meta = RequestMeta {
            msg_type: 1,
            request_id: 1,
            timestamp: 1,
        };
        let mut bytes = write_request(&meta, &[]);
        bytes[14..18].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_request(&bytes),
            Err(PacketError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_payload_fails_decode() {
        let proto = PacketProtocol::msgpack();
        assert!(matches!(
            proto.decode_payload::<Chat>(&[0xC1]),
            Err(PacketError::Decode(_))
        ));
    }

    #[test]
    fn request_ids_start_at_one() {
        let ids = RequestIds::default();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn request_ids_wrap_modulo_u32_max() {
        let ids = RequestIds::starting_after(REQUEST_ID_MODULUS - 2);
        assert_eq!(ids.next_id(), 0xFFFF_FFFE);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn request_parse_matches_written(
            msg_type in any::<u16>(),
            request_id in any::<u32>(),
            timestamp in any::<u64>(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let meta = RequestMeta { msg_type, request_id, timestamp };
            let parsed = decode_request(&write_request(&meta, &payload)).unwrap();
            prop_assert_eq!(parsed.meta, meta);
            prop_assert_eq!(parsed.payload, payload);
        }

        #[test]
        fn response_meta_matches_full_decode(
            msg_type in any::<u16>(),
            request_id in any::<u32>(),
            code in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let meta = ResponseMeta { msg_type, request_id, timestamp: 1, code };
            let bytes = write_response(&meta, &payload);
            prop_assert_eq!(decode_response_meta(&bytes).unwrap(), decode_response(&bytes).unwrap().meta);
        }

        #[test]
        fn request_ids_never_reach_modulus(start in any::<u32>()) {
            let ids = RequestIds::starting_after(start);
            prop_assert!(ids.next_id() < REQUEST_ID_MODULUS);
        }

        #[test]
        fn truncated_packets_never_panic(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_request(&data);
            let _ = decode_response(&data);
            let _ = decode_response_meta(&data);
        }
    }
}
