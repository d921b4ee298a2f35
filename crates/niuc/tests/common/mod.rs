#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use niu_common::canonical::{canonicalize, SignPayload};
use niu_common::crypto::{self, BoxCrypter, BoxKeyPair};
use niu_common::secure_string::decode_secure_string;
use niu_common::types::{content_type, header};
use niuc::config::ClientConfig;
use niuc::error::SocketError;
use niuc::socket::{SocketEventSink, SocketHandle};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use wiremock::{Request, Respond, ResponseTemplate};
use x25519_dalek::PublicKey as X25519Public;

// ── Signed HTTP server side ─────────────────────────────────────────

/// Key material of the fake API server.
#[derive(Clone)]
pub struct ServerKeys {
    pub sign: SigningKey,
    pub boxed: BoxKeyPair,
}

impl ServerKeys {
    pub fn generate() -> Self {
        Self {
            sign: crypto::generate_sign_keypair(),
            boxed: crypto::generate_box_keypair(),
        }
    }

    /// Client configuration pointing at `base_url` and trusting these keys.
    pub fn config(&self, base_url: &str, encryption: bool) -> ClientConfig {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut config = ClientConfig::default();
        config.api.base_url = base_url.to_string();
        config.api.encryption = encryption;
        config.api.server_sign_key = b64.encode(self.sign.verifying_key().to_bytes());
        config.api.server_box_key = b64.encode(self.boxed.public_bytes());
        config.retry.max_retries = 2;
        config.retry.base_delay_ms = 10;
        config
    }

    /// 200 responder signing `body`.
    pub fn reply(&self, body: Value) -> SignedReply {
        SignedReply {
            keys: self.clone(),
            body: Some(body.to_string()),
            set_cookies: Vec::new(),
            encrypt: false,
            forged: false,
            delay: None,
        }
    }

    /// 200 responder that opens the request body and returns it.
    pub fn echo(&self) -> SignedReply {
        SignedReply {
            body: None,
            ..self.reply(Value::Null)
        }
    }
}

/// Signs every response the way the API server does.
#[derive(Clone)]
pub struct SignedReply {
    keys: ServerKeys,
    body: Option<String>,
    set_cookies: Vec<String>,
    encrypt: bool,
    forged: bool,
    delay: Option<Duration>,
}

impl SignedReply {
    pub fn set_cookie(mut self, line: &str) -> Self {
        self.set_cookies.push(line.to_string());
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    /// Signs with a key the client does not trust.
    pub fn forged(mut self) -> Self {
        self.forged = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn crypter(&self, session: &str) -> BoxCrypter {
        let (_, client_box) = decode_secure_string(session).unwrap();
        BoxCrypter::new(&self.keys.boxed.secret, &X25519Public::from(client_box))
    }
}

fn header_str(request: &Request, name: &str) -> String {
    request
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Canonical query as the server reconstructs it from the URL.
fn url_query(request: &Request) -> String {
    let map: Map<String, Value> = request
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    if map.is_empty() {
        String::new()
    } else {
        canonicalize(&Value::Object(map))
    }
}

impl Respond for SignedReply {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let session = header_str(request, header::SESSION);
        let platform = header_str(request, header::PLATFORM);

        let plain = match &self.body {
            Some(body) => body.clone(),
            None => {
                let raw = String::from_utf8(request.body.clone()).unwrap();
                if header_str(request, "content-type") == content_type::ENCRYPTED {
                    String::from_utf8(self.crypter(&session).decrypt_base64(&raw).unwrap())
                        .unwrap()
                } else {
                    raw
                }
            }
        };
        let (raw, mime) = if self.encrypt {
            let sealed = self
                .crypter(&session)
                .encrypt_to_base64(plain.as_bytes())
                .unwrap();
            (sealed, content_type::ENCRYPTED)
        } else {
            (plain, content_type::JSON)
        };

        let nonce = crypto::generate_nonce();
        let timestamp = crypto::unix_now().to_string();
        let query = url_query(request);
        let payload = SignPayload {
            session: &session,
            nonce: &nonce,
            timestamp: &timestamp,
            platform: &platform,
            method: request.method.as_str(),
            path: request.url.path(),
            query: &query,
            body: Some(&raw),
        };
        let key = if self.forged {
            SigningKey::from_bytes(&[7u8; 32])
        } else {
            self.keys.sign.clone()
        };
        let signature = crypto::sign_base64(&key, &payload.canonical());

        let mut template = ResponseTemplate::new(200)
            .set_body_raw(raw.into_bytes(), mime)
            .insert_header(header::NONCE, nonce.as_str())
            .insert_header(header::TIMESTAMP, timestamp.as_str())
            .insert_header(header::SIGNATURE, signature.as_str());
        if self.encrypt {
            template = template.insert_header(header::ORIGIN_CONTENT_TYPE, content_type::JSON);
        }
        for line in &self.set_cookies {
            template = template.append_header("set-cookie", line.as_str());
        }
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

// ── WebSocket server side ───────────────────────────────────────────

pub type ServerWs = WebSocketStream<TcpStream>;

/// Binds a local listener and returns it with its `ws://` URL.
pub async fn ws_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    (listener, format!("ws://{addr}/ws"))
}

/// Accepts the next WebSocket connection.
pub async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection within 5s")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Next binary frame from the client, skipping control frames.
pub async fn next_binary(ws: &mut ServerWs) -> Vec<u8> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = msg {
            return data;
        }
    }
}

pub async fn send_binary(ws: &mut ServerWs, data: Vec<u8>) {
    ws.send(Message::Binary(data)).await.unwrap();
}

/// Events a socket reported, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Connected,
    Data(Vec<u8>),
    WillReconnect(Duration),
    Error(String),
    Disposed(Option<String>),
}

/// Forwards every callback into a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SocketEventSink for ChannelSink {
    fn on_connected(&self, _handle: &SocketHandle) {
        let _ = self.tx.send(SinkEvent::Connected);
    }

    fn on_data(&self, data: Vec<u8>, _handle: &SocketHandle) {
        let _ = self.tx.send(SinkEvent::Data(data));
    }

    fn on_will_reconnect(&self, delay: Duration) {
        let _ = self.tx.send(SinkEvent::WillReconnect(delay));
    }

    fn on_error(&self, error: &SocketError) {
        let _ = self.tx.send(SinkEvent::Error(error.to_string()));
    }

    fn on_dispose(&self, reason: Option<&SocketError>) {
        let _ = self.tx.send(SinkEvent::Disposed(reason.map(ToString::to_string)));
    }
}

/// Next sink event, failing the test after 5s.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no socket event within 5s")
        .expect("sink channel closed")
}
