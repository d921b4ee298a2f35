//! Reconnecting WebSocket engine.
//!
//! One spawned task owns the socket and both timers. Data sent while the
//! socket is not open is buffered and replayed in order on the next open.
//! The buffer belongs to the client, not the task, so sends left over when
//! an engine gives up are replayed by the next `connect()`. Lifecycle
//! events go to a [`SocketEventSink`].
//!
//! Close codes 1000..=1003 and client-initiated closes are terminal. Any
//! other closure schedules a reconnect from the retry strategy, unless the
//! socket has never been open during this `connect()`, in which case the
//! handshake failure is terminal as well.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use niu_common::types::close_code;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::retry::{ExponentialRetryStrategy, RetryStrategy};

/// Reason sent with a client-initiated close.
pub const CLIENT_CLOSE_REASON: &str = "closeByClient";

/// How long to wait for the peer's close reply.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `connect()` not yet called.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Connected; heartbeat running.
    Open,
    /// Waiting out a reconnect delay.
    Reconnecting,
    /// Client-initiated close in progress.
    Closing,
    /// Terminal until the next `connect()`.
    Closed,
}

impl ConnectionState {
    /// Lower-case name used in logs and the local API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// True when an engine task is running for this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Open | Self::Reconnecting | Self::Closing
        )
    }
}

/// Receives socket lifecycle events.
///
/// Callbacks run on the engine task and must not block. Use the handle to
/// send from inside a callback; the data is queued behind the callback.
pub trait SocketEventSink: Send + Sync + 'static {
    /// The socket opened and buffered data was flushed.
    fn on_connected(&self, _handle: &SocketHandle) {}
    /// A data frame arrived.
    fn on_data(&self, _data: Vec<u8>, _handle: &SocketHandle) {}
    /// The heartbeat interval elapsed while open.
    fn on_heartbeat_tick(&self, _handle: &SocketHandle) {}
    /// A reconnect is scheduled after `delay`.
    fn on_will_reconnect(&self, _delay: Duration) {}
    /// A non-terminal error occurred.
    fn on_error(&self, _error: &SocketError) {}
    /// The engine stopped. `reason` is `None` for clean closes.
    fn on_dispose(&self, _reason: Option<&SocketError>) {}
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// WebSocket URL.
    pub url: String,
    /// Offered subprotocols.
    pub subprotocols: Vec<String>,
    /// Heartbeat period while open.
    pub heartbeat_interval: Duration,
}

impl From<&SocketConfig> for SocketOptions {
    fn from(config: &SocketConfig) -> Self {
        Self {
            url: config.url.clone(),
            subprotocols: config.subprotocols.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
        }
    }
}

/// Exponential reconnect policy from configuration.
#[must_use]
pub fn reconnect_strategy(config: &SocketConfig) -> Box<dyn RetryStrategy> {
    Box::new(ExponentialRetryStrategy::new(
        Duration::from_millis(config.reconnect_base_ms),
        config.max_reconnect_attempts,
    ))
}

#[derive(Debug)]
enum Command {
    Send(Vec<u8>),
    /// Close the engine started by the `connect()` of this generation.
    Close(u64),
}

/// Cloneable handle for sending and observing state.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SocketHandle {
    /// Sends now if open, otherwise buffers for the next open.
    pub fn send(&self, data: Vec<u8>) {
        if self.cmd_tx.send(Command::Send(data)).is_err() {
            debug!("socket client dropped, data discarded");
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// State change subscription.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

type SharedRetry = Arc<Mutex<Option<Box<dyn RetryStrategy>>>>;
type SharedBuffer = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Owner of the engine task.
pub struct SocketClient {
    options: SocketOptions,
    sink: Arc<dyn SocketEventSink>,
    handle: SocketHandle,
    cmd_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    retry: SharedRetry,
    buffer: SharedBuffer,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("url", &self.options.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SocketClient {
    /// Idle client; `retry` of `None` disables reconnection.
    #[must_use]
    pub fn new(
        options: SocketOptions,
        sink: Arc<dyn SocketEventSink>,
        retry: Option<Box<dyn RetryStrategy>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        Self {
            options,
            sink,
            handle: SocketHandle { cmd_tx, state_rx },
            cmd_rx: Arc::new(tokio::sync::Mutex::new(cmd_rx)),
            state_tx: Arc::new(state_tx),
            retry: Arc::new(Mutex::new(retry)),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            generation: 0,
            task: None,
        }
    }

    /// Starts the engine. No-op while one is already running.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect(&mut self) {
        if self.state().is_active() {
            debug!(url = %self.options.url, "connect ignored, already active");
            return;
        }
        self.state_tx.send_replace(ConnectionState::Connecting);
        self.generation += 1;
        let engine = Engine {
            generation: self.generation,
            options: self.options.clone(),
            sink: Arc::clone(&self.sink),
            handle: self.handle.clone(),
            state_tx: Arc::clone(&self.state_tx),
            retry: Arc::clone(&self.retry),
            buffer: Arc::clone(&self.buffer),
        };
        let cmd_rx = Arc::clone(&self.cmd_rx);
        self.task = Some(tokio::spawn(async move {
            let mut rx = cmd_rx.lock().await;
            engine.run(&mut rx).await;
        }));
    }

    /// Replaces the settings used by the next `connect()`. Buffered sends
    /// are kept. Returns false, changing nothing, while an engine runs.
    pub fn set_options(&mut self, options: SocketOptions) -> bool {
        if self.state().is_active() {
            return false;
        }
        debug!(from = %self.options.url, to = %options.url, "socket options replaced");
        self.options = options;
        true
    }

    /// Sends now if open, otherwise buffers for the next open.
    pub fn send(&self, data: Vec<u8>) {
        self.handle.send(data);
    }

    /// Client-initiated close with code 1000. Suppresses reconnection.
    pub fn close(&self) {
        if !self.state().is_active() {
            return;
        }
        if self.handle.cmd_tx.send(Command::Close(self.generation)).is_err() {
            debug!("socket engine already gone");
        }
    }

    /// Closes and waits for the engine to stop.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "socket engine task failed");
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Handle for other tasks.
    #[must_use]
    pub fn handle(&self) -> SocketHandle {
        self.handle.clone()
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Why the open phase ended.
enum OpenExit {
    ClientClose,
    Clean(u16),
    Abnormal(Option<u16>),
    Dropped,
}

/// Why a wait outside the open phase ended early.
enum Interrupt {
    Close,
    Dropped,
}

struct Engine {
    generation: u64,
    options: SocketOptions,
    sink: Arc<dyn SocketEventSink>,
    handle: SocketHandle,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    retry: SharedRetry,
    buffer: SharedBuffer,
}

impl Engine {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn retry(&self) -> MutexGuard<'_, Option<Box<dyn RetryStrategy>>> {
        match self.retry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("retry strategy lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    /// Sends not yet written; outlives the engine so the next `connect()`
    /// replays them.
    fn buffer(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("send buffer lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    fn dispose(&self, reason: Option<SocketError>) {
        if let Some(retry) = self.retry().as_mut() {
            retry.reset();
        }
        self.set_state(ConnectionState::Closed);
        match &reason {
            Some(e) => warn!(url = %self.options.url, error = %e, "socket disposed"),
            None => info!(url = %self.options.url, "socket closed"),
        }
        self.sink.on_dispose(reason.as_ref());
    }

    /// Buffers sends until `fut` completes or a close/drop interrupts.
    async fn wait_buffering<F, T>(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Command>,
        fut: F,
    ) -> Result<T, Interrupt>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                cmd = rx.recv() => match cmd {
                    Some(Command::Send(data)) => {
                        self.buffer().push_back(data);
                    }
                    Some(Command::Close(g)) if g == self.generation => {
                        return Err(Interrupt::Close);
                    }
                    Some(Command::Close(g)) => debug!(generation = g, "stale close ignored"),
                    None => return Err(Interrupt::Dropped),
                },
            }
        }
    }

    async fn run(mut self, rx: &mut mpsc::UnboundedReceiver<Command>) {
        let mut opens: u64 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            info!(url = %self.options.url, "connecting");

            let request = match self.build_request() {
                Ok(req) => req,
                Err(e) => {
                    error!(error = %e, "invalid socket request");
                    self.dispose(Some(SocketError::HandshakeNeverSucceeded(e.to_string())));
                    return;
                }
            };
            let connected = match self
                .wait_buffering(rx, tokio_tungstenite::connect_async(request))
                .await
            {
                Ok(result) => result,
                Err(Interrupt::Close) => {
                    self.dispose(None);
                    return;
                }
                Err(Interrupt::Dropped) => return,
            };

            let abnormal = match connected {
                Err(e) if opens == 0 => {
                    error!(error = %e, "handshake failed before first open, not reconnecting");
                    self.dispose(Some(SocketError::HandshakeNeverSucceeded(e.to_string())));
                    return;
                }
                Err(e) => {
                    let err = SocketError::WebSocket(e);
                    warn!(error = %err, "reconnect handshake failed");
                    self.sink.on_error(&err);
                    None
                }
                Ok((ws, _)) => {
                    opens += 1;
                    match self.run_open(ws, rx).await {
                        OpenExit::ClientClose => {
                            self.dispose(None);
                            return;
                        }
                        OpenExit::Clean(code) => {
                            info!(code, "peer closed cleanly");
                            self.dispose(None);
                            return;
                        }
                        OpenExit::Dropped => return,
                        OpenExit::Abnormal(code) => {
                            let err = SocketError::AbnormalClosure { code };
                            warn!(error = %err, "connection lost");
                            self.sink.on_error(&err);
                            code
                        }
                    }
                }
            };

            let next = self.retry().as_mut().map(|r| r.next());
            let delay = match next {
                None => {
                    self.dispose(Some(SocketError::AbnormalClosure { code: abnormal }));
                    return;
                }
                Some(None) => {
                    self.dispose(Some(SocketError::ReconnectExhausted));
                    return;
                }
                Some(Some(delay)) => delay,
            };

            self.set_state(ConnectionState::Reconnecting);
            info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting"
            );
            self.sink.on_will_reconnect(delay);
            match self.wait_buffering(rx, tokio::time::sleep(delay)).await {
                Ok(()) => {}
                Err(Interrupt::Close) => {
                    self.dispose(None);
                    return;
                }
                Err(Interrupt::Dropped) => return,
            }
        }
    }

    fn build_request(
        &self,
    ) -> Result<Request, WsError> {
        let mut req = self.options.url.as_str().into_client_request()?;
        if !self.options.subprotocols.is_empty() {
            let value = HeaderValue::from_str(&self.options.subprotocols.join(", "))
                .map_err(|e| WsError::HttpFormat(e.into()))?;
            req.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
        Ok(req)
    }

    async fn run_open<S>(
        &mut self,
        ws: WebSocketStream<S>,
        rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> OpenExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();

        if let Some(retry) = self.retry().as_mut() {
            retry.reset();
        }
        self.set_state(ConnectionState::Open);
        let period = self.options.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let mut buffered = 0usize;
        loop {
            let next = self.buffer().pop_front();
            let Some(data) = next else {
                break;
            };
            if let Err(e) = ws_tx.send(Message::Binary(data.clone())).await {
                self.buffer().push_front(data);
                warn!(error = %e, "flush failed");
                return OpenExit::Abnormal(None);
            }
            buffered += 1;
        }
        info!(url = %self.options.url, buffered, "socket open");
        self.sink.on_connected(&self.handle);

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            debug!(error = %e, "socket read failed");
                            return OpenExit::Abnormal(None);
                        }
                        None => return OpenExit::Abnormal(None),
                    };
                    match msg {
                        Message::Binary(data) => self.sink.on_data(data, &self.handle),
                        Message::Text(text) => self.sink.on_data(text.into_bytes(), &self.handle),
                        Message::Ping(data) => {
                            if ws_tx.send(Message::Pong(data)).await.is_err() {
                                return OpenExit::Abnormal(None);
                            }
                        }
                        Message::Close(frame) => {
                            let code = frame.map(|f| u16::from(f.code));
                            return match code {
                                Some(c) if close_code::is_clean(c) => OpenExit::Clean(c),
                                other => OpenExit::Abnormal(other),
                            };
                        }
                        _ => {}
                    }
                }

                cmd = rx.recv() => match cmd {
                    Some(Command::Send(data)) => {
                        if let Err(e) = ws_tx.send(Message::Binary(data.clone())).await {
                            debug!(error = %e, "send failed, buffering");
                            self.buffer().push_back(data);
                            return OpenExit::Abnormal(None);
                        }
                    }
                    Some(Command::Close(g)) if g == self.generation => {
                        self.close_socket(&mut ws_tx, &mut ws_rx).await;
                        return OpenExit::ClientClose;
                    }
                    Some(Command::Close(g)) => debug!(generation = g, "stale close ignored"),
                    None => return OpenExit::Dropped,
                },

                _ = heartbeat.tick() => {
                    self.sink.on_heartbeat_tick(&self.handle);
                }
            }
        }
    }

    async fn close_socket<S>(
        &self,
        ws_tx: &mut SplitSink<WebSocketStream<S>, Message>,
        ws_rx: &mut SplitStream<WebSocketStream<S>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_state(ConnectionState::Closing);
        let frame = CloseFrame {
            code: CloseCode::from(close_code::NORMAL),
            reason: Cow::Borrowed(CLIENT_CLOSE_REASON),
        };
        if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "close frame not sent");
            return;
        }
        let drain = async {
            while let Some(Ok(msg)) = ws_rx.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
            debug!("peer did not answer close in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(!ConnectionState::Idle.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Closed.is_active());
    }

    #[test]
    fn test_options_from_config() {
        let config = SocketConfig {
            heartbeat_interval_ms: 1500,
            subprotocols: vec!["niu.v1".into()],
            ..SocketConfig::default()
        };
        let options = SocketOptions::from(&config);
        assert_eq!(options.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(options.subprotocols, vec!["niu.v1".to_string()]);
    }

    #[test]
    fn test_reconnect_strategy_follows_config() {
        let config = SocketConfig {
            reconnect_base_ms: 100,
            max_reconnect_attempts: 2,
            ..SocketConfig::default()
        };
        let mut retry = reconnect_strategy(&config);
        assert_eq!(retry.next(), Some(Duration::from_millis(100)));
        assert_eq!(retry.next(), Some(Duration::from_millis(200)));
        assert_eq!(retry.next(), None);
    }

    struct Silent;
    impl SocketEventSink for Silent {}

    #[tokio::test]
    async fn test_send_before_connect_is_kept() {
        let client = SocketClient::new(
            SocketOptions {
                url: "ws://127.0.0.1:9/ws".into(),
                subprotocols: Vec::new(),
                heartbeat_interval: Duration::from_secs(30),
            },
            Arc::new(Silent),
            None,
        );
        client.send(b"a".to_vec());
        client.close();
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_first_connect_is_terminal() {
        let mut client = SocketClient::new(
            SocketOptions {
                url: "ws://127.0.0.1:9/ws".into(),
                subprotocols: Vec::new(),
                heartbeat_interval: Duration::from_secs(30),
            },
            Arc::new(Silent),
            Some(Box::new(ExponentialRetryStrategy::new(
                Duration::from_millis(10),
                3,
            ))),
        );
        let mut state = client.handle().watch_state();
        client.connect();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Closed),
        )
        .await
        .expect("closed in time")
        .expect("state channel open");
    }

    fn local(url: String) -> SocketOptions {
        SocketOptions {
            url,
            subprotocols: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_set_options_only_while_inactive() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = SocketClient::new(local("ws://127.0.0.1:9/ws".into()), Arc::new(Silent), None);

        assert!(client.set_options(local(format!("ws://{addr}/ws"))));
        client.connect();
        assert!(!client.set_options(local("ws://127.0.0.1:9/other".into())));

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let _server = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(client.options.url, format!("ws://{addr}/ws"));
    }

    #[tokio::test]
    async fn test_stale_close_does_not_stop_next_engine() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = SocketClient::new(local(format!("ws://{addr}/ws")), Arc::new(Silent), None);

        // left behind by an engine that stopped before reading it
        client
            .handle
            .cmd_tx
            .send(Command::Close(client.generation))
            .unwrap();
        client.connect();

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();
        client.send(b"still open".to_vec());
        let msg = tokio::time::timeout(Duration::from_secs(5), server.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Binary(b"still open".to_vec()));
        assert_eq!(client.state(), ConnectionState::Open);
    }
}
