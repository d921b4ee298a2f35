use thiserror::Error;

/// Errors surfaced by the signed HTTP pipeline.
#[derive(Error, Debug)]
pub enum HttpError {
    /// Session key material is missing or corrupt.
    #[error("session secrets unavailable: {0}")]
    SecretsUnavailable(#[from] SessionError),
    /// The response signature did not verify; the body was discarded.
    #[error("response signature verification failed")]
    SignatureVerificationFailed,
    /// Authorization failed and could not be recovered.
    #[error("unauthorized, login required at {login_url}")]
    Unauthorized {
        /// Login location carrying the return path.
        login_url: String,
    },
    /// A 5xx status persisted through every retry.
    #[error("server error {status} after {attempts} attempts")]
    TransientServerError {
        /// Last status received.
        status: u16,
        /// Total attempts made.
        attempts: u32,
    },
    /// Any other non-200 status.
    #[error("unexpected status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The body was not the JSON the caller asked for.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// An encrypted body could not be opened.
    #[error("response decryption failed: {0}")]
    Decrypt(#[from] niu_common::CryptoError),
    /// Network failure or timeout.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpError {
    /// True for caller-initiated cancellation, which is not a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP status carried by this error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::TransientServerError { status, .. } | Self::Status { status, .. } => {
                Some(*status)
            }
            Self::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }
}

/// Errors reading session keys from cookies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A session cookie is absent.
    #[error("missing cookie: {0}")]
    Missing(&'static str),
    /// A session cookie did not decode.
    #[error("malformed cookie: {0}")]
    Malformed(&'static str),
    /// Public keys in `sid` do not belong to the private keys in `cid`.
    #[error("session cookies do not match")]
    Mismatch,
}

/// Terminal outcomes of the reconnecting socket.
#[derive(Error, Debug)]
pub enum SocketError {
    /// The very first handshake failed; no reconnect is attempted.
    #[error("handshake never succeeded: {0}")]
    HandshakeNeverSucceeded(String),
    /// The connection dropped without a clean close code.
    #[error("abnormal closure (code {code:?})")]
    AbnormalClosure {
        /// Close code, when the peer sent one.
        code: Option<u16>,
    },
    /// The retry strategy gave up.
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// A frame could not be encoded or decoded.
    #[error("packet error: {0}")]
    Packet(#[from] niu_common::PacketError),
    /// No response arrived for a correlated call.
    #[error("no response to request {request_id} in time")]
    Timeout {
        /// Request id of the unanswered call.
        request_id: u32,
    },
    /// The client was closed before the call completed.
    #[error("socket closed")]
    Closed,
}
