//! Packet client on top of the socket engine.
//!
//! Frames every outbound message with the binary packet protocol, pings on
//! each heartbeat tick, correlates responses to calls by request id and
//! broadcasts every inbound frame except pongs.

use niu_common::packet::{decode_response, PacketProtocol, RequestIds, ResponsePacket};
use niu_common::types::msg_type;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::retry::RetryStrategy;
use crate::socket::{
    reconnect_strategy, ConnectionState, SocketClient, SocketEventSink, SocketHandle,
    SocketOptions,
};

const FRAME_CHANNEL_CAPACITY: usize = 256;

type Pending = HashMap<u32, oneshot::Sender<ResponsePacket>>;

struct Dispatch {
    protocol: PacketProtocol,
    ids: RequestIds,
    pending: Mutex<Pending>,
    frames: broadcast::Sender<ResponsePacket>,
}

impl Dispatch {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("pending call map lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }
}

impl SocketEventSink for Dispatch {
    fn on_connected(&self, _handle: &SocketHandle) {
        info!("packet socket connected");
    }

    fn on_data(&self, data: Vec<u8>, _handle: &SocketHandle) {
        let packet = match decode_response(&data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, len = data.len(), "dropping undecodable frame");
                return;
            }
        };
        let meta = packet.meta;
        if meta.msg_type == msg_type::PONG {
            debug!(request_id = meta.request_id, "pong received");
            return;
        }
        debug!(
            msg_type = meta.msg_type,
            request_id = meta.request_id,
            code = meta.code,
            "frame received"
        );
        if let Some(tx) = self.pending().remove(&meta.request_id) {
            let _ = tx.send(packet.clone());
        }
        if self.frames.send(packet).is_err() {
            debug!("frame dropped: no active subscribers");
        }
    }

    fn on_heartbeat_tick(&self, handle: &SocketHandle) {
        let request_id = self.ids.next_id();
        match self
            .protocol
            .encode_request::<()>(msg_type::PING, request_id, None)
        {
            Ok(bytes) => {
                debug!(request_id, "ping");
                handle.send(bytes);
            }
            Err(e) => warn!(error = %e, "ping encode failed"),
        }
    }

    fn on_will_reconnect(&self, delay: Duration) {
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "packet socket will reconnect"
        );
    }

    fn on_error(&self, error: &SocketError) {
        warn!(%error, "packet socket error");
    }

    fn on_dispose(&self, reason: Option<&SocketError>) {
        let dropped = {
            let mut pending = self.pending();
            let n = pending.len();
            pending.clear();
            n
        };
        match reason {
            Some(e) => warn!(error = %e, dropped, "packet socket disposed"),
            None => info!(dropped, "packet socket disposed"),
        }
    }
}

/// Packet-level client: framing, heartbeat pings and call correlation.
#[derive(Debug)]
pub struct SocketMessenger {
    client: SocketClient,
    dispatch: Arc<Dispatch>,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("pending", &self.pending().len())
            .finish_non_exhaustive()
    }
}

impl SocketMessenger {
    /// Idle messenger; `retry` of `None` disables reconnection.
    #[must_use]
    pub fn new(options: SocketOptions, retry: Option<Box<dyn RetryStrategy>>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let dispatch = Arc::new(Dispatch {
            protocol: PacketProtocol::msgpack(),
            ids: RequestIds::default(),
            pending: Mutex::new(HashMap::new()),
            frames,
        });
        let sink: Arc<dyn SocketEventSink> = dispatch.clone();
        Self {
            client: SocketClient::new(options, sink, retry),
            dispatch,
        }
    }

    /// Messenger with exponential reconnects from configuration.
    #[must_use]
    pub fn from_config(config: &SocketConfig) -> Self {
        Self::new(SocketOptions::from(config), Some(reconnect_strategy(config)))
    }

    /// Settings for the next `connect()`; see [`SocketClient::set_options`].
    pub fn set_options(&mut self, options: SocketOptions) -> bool {
        self.client.set_options(options)
    }

    /// Starts the socket engine.
    pub fn connect(&mut self) {
        self.client.connect();
    }

    /// Client-initiated close.
    pub fn close(&self) {
        self.client.close();
    }

    /// Closes and waits for the engine to stop.
    pub async fn shutdown(&mut self) {
        self.client.shutdown().await;
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Connection state subscription.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.client.handle().watch_state()
    }

    /// Subscribes to inbound frames.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResponsePacket> {
        self.dispatch.frames.subscribe()
    }

    /// Frames and sends a message, returning its request id. Buffered while
    /// the socket is not open.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Packet`] if the payload cannot be encoded.
    pub fn send_message<T: Serialize + ?Sized>(
        &self,
        msg_type: u16,
        payload: Option<&T>,
    ) -> Result<u32, SocketError> {
        let request_id = self.dispatch.ids.next_id();
        self.send_framed(msg_type, request_id, payload)?;
        Ok(request_id)
    }

    /// Sends a message and waits for the response with the same request id.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Timeout`] if no response arrives in `timeout`,
    /// [`SocketError::Closed`] if the socket is disposed first, or
    /// [`SocketError::Packet`] if the payload cannot be encoded.
    pub async fn call<T: Serialize + ?Sized>(
        &self,
        msg_type: u16,
        payload: Option<&T>,
        timeout: Duration,
    ) -> Result<ResponsePacket, SocketError> {
        let request_id = self.dispatch.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.dispatch.pending().insert(request_id, tx);
        if let Err(e) = self.send_framed(msg_type, request_id, payload) {
            self.dispatch.pending().remove(&request_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(SocketError::Closed),
            Err(_) => {
                self.dispatch.pending().remove(&request_id);
                Err(SocketError::Timeout { request_id })
            }
        }
    }

    /// Decodes a frame payload with the messenger's marshaler.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Packet`] if the payload is not a `T`.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(
        &self,
        packet: &ResponsePacket,
    ) -> Result<Option<T>, SocketError> {
        Ok(self.dispatch.protocol.decode_payload(&packet.payload)?)
    }

    fn send_framed<T: Serialize + ?Sized>(
        &self,
        msg_type: u16,
        request_id: u32,
        payload: Option<&T>,
    ) -> Result<(), SocketError> {
        let bytes = self
            .dispatch
            .protocol
            .encode_request(msg_type, request_id, payload)?;
        debug!(msg_type, request_id, len = bytes.len(), "frame queued");
        self.client.send(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle() -> SocketMessenger {
        SocketMessenger::new(
            SocketOptions {
                url: "ws://127.0.0.1:9/ws".into(),
                subprotocols: Vec::new(),
                heartbeat_interval: Duration::from_secs(30),
            },
            None,
        )
    }

    #[test]
    fn test_request_ids_increase() {
        let m = idle();
        let a = m.send_message(0x0100, Some(&"x")).unwrap();
        let b = m.send_message::<()>(0x0100, None).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_response_resolves_pending_and_broadcasts() {
        let m = idle();
        let mut frames = m.subscribe();
        let (tx, mut rx) = oneshot::channel();
        m.dispatch.pending().insert(9, tx);

        let bytes = PacketProtocol::msgpack()
            .encode_response(0x0100, 9, 0, Some(&"ok"))
            .unwrap();
        m.dispatch.on_data(bytes, &m.client.handle());

        let resolved = rx.try_recv().unwrap();
        assert_eq!(resolved.meta.request_id, 9);
        assert_eq!(frames.try_recv().unwrap().meta.code, 0);
        let decoded: Option<String> = m.decode_payload(&resolved).unwrap();
        assert_eq!(decoded.as_deref(), Some("ok"));
    }

    #[test]
    fn test_pong_is_not_broadcast() {
        let m = idle();
        let mut frames = m.subscribe();
        let bytes = PacketProtocol::msgpack()
            .encode_response::<()>(msg_type::PONG, 1, 0, None)
            .unwrap();
        m.dispatch.on_data(bytes, &m.client.handle());
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let m = idle();
        let mut frames = m.subscribe();
        m.dispatch.on_data(vec![1, 2, 3], &m.client.handle());
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_dispose_fails_pending_calls() {
        let m = idle();
        let (tx, mut rx) = oneshot::channel();
        m.dispatch.pending().insert(1, tx);
        m.dispatch.on_dispose(Some(&SocketError::ReconnectExhausted));
        assert!(rx.try_recv().is_err());
        assert!(m.dispatch.pending().is_empty());
    }
}
