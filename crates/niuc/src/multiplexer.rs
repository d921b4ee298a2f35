//! One socket shared by many local consumers.
//!
//! The multiplexer is an actor owning at most one [`SocketMessenger`].
//! Consumers hold a cloneable [`Multiplexer`] handle and register ports to
//! receive inbound frames and connection-state changes. Every event goes
//! to every registered port.

use niu_common::packet::ResponsePacket;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SocketConfig;
use crate::error::SocketError;
use crate::messenger::SocketMessenger;
use crate::socket::{ConnectionState, SocketOptions};

const COMMAND_CAPACITY: usize = 64;
const PORT_CAPACITY: usize = 256;

/// Overrides applied to the base socket settings on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// WebSocket URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Offered subprotocols.
    #[serde(default)]
    pub subprotocols: Option<Vec<String>>,
}

impl ConnectParams {
    fn apply(&self, base: &SocketConfig) -> SocketConfig {
        let mut config = base.clone();
        if let Some(url) = &self.url {
            config.url.clone_from(url);
        }
        if let Some(protocols) = &self.subprotocols {
            config.subprotocols.clone_from(protocols);
        }
        config
    }
}

/// Event delivered to every port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Connection state changed.
    State(ConnectionState),
    /// Inbound frame.
    Frame(ResponsePacket),
}

/// A registered consumer.
#[derive(Debug)]
pub struct Port {
    /// Registry id.
    pub id: u64,
    /// Event stream; closes when the port is unregistered or the
    /// multiplexer stops.
    pub events: mpsc::Receiver<PortEvent>,
}

enum Command {
    Connect {
        params: ConnectParams,
        reply: oneshot::Sender<bool>,
    },
    Close {
        reply: oneshot::Sender<bool>,
    },
    Send {
        msg_type: u16,
        payload: Option<Value>,
        reply: oneshot::Sender<Result<u32, SocketError>>,
    },
    Register {
        reply: oneshot::Sender<Port>,
    },
    Unregister {
        id: u64,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
}

/// Handle to the multiplexer actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Multiplexer {
    tx: mpsc::Sender<Command>,
}

impl Multiplexer {
    /// Spawns the actor. It stops when every handle is dropped.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(base: SocketConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let actor = Actor {
            base,
            messenger: None,
            frames: None,
            states: None,
            ports: HashMap::new(),
            next_port: 0,
        };
        (Self { tx }, tokio::spawn(actor.run(rx)))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SocketError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SocketError::Closed)?;
        rx.await.map_err(|_| SocketError::Closed)
    }

    /// Creates the socket if needed and opens it with `params` applied over
    /// the base settings. Returns false when a connection was already
    /// active.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the actor has stopped.
    pub async fn connect_socket(&self, params: ConnectParams) -> Result<bool, SocketError> {
        self.request(|reply| Command::Connect { params, reply }).await
    }

    /// Closes and discards the socket. Returns false when there was none.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the actor has stopped.
    pub async fn close_socket(&self) -> Result<bool, SocketError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Frames and sends a message, returning its correlation id. Buffered
    /// until the socket opens.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Packet`] if the payload cannot be encoded or
    /// [`SocketError::Closed`] if the actor has stopped.
    pub async fn send_socket_message(
        &self,
        msg_type: u16,
        payload: Option<Value>,
    ) -> Result<u32, SocketError> {
        self.request(|reply| Command::Send {
            msg_type,
            payload,
            reply,
        })
        .await?
    }

    /// Registers a port. The current state is delivered first.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the actor has stopped.
    pub async fn register(&self) -> Result<Port, SocketError> {
        self.request(|reply| Command::Register { reply }).await
    }

    /// State of the current socket, `Idle` when there is none.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the actor has stopped.
    pub async fn state(&self) -> Result<ConnectionState, SocketError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Removes a port from the registry.
    pub async fn unregister(&self, id: u64) {
        if self.tx.send(Command::Unregister { id }).await.is_err() {
            debug!(port = id, "multiplexer gone, nothing to unregister");
        }
    }
}

struct Actor {
    base: SocketConfig,
    messenger: Option<SocketMessenger>,
    frames: Option<broadcast::Receiver<ResponsePacket>>,
    states: Option<watch::Receiver<ConnectionState>>,
    ports: HashMap<u64, mpsc::Sender<PortEvent>>,
    next_port: u64,
}

async fn next_frame(
    frames: &mut Option<broadcast::Receiver<ResponsePacket>>,
) -> Result<ResponsePacket, broadcast::error::RecvError> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_state(
    states: &mut Option<watch::Receiver<ConnectionState>>,
) -> Result<ConnectionState, watch::error::RecvError> {
    match states {
        Some(rx) => {
            rx.changed().await?;
            let state = *rx.borrow_and_update();
            Ok(state)
        }
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd);
                }
                frame = next_frame(&mut self.frames) => match frame {
                    Ok(packet) => self.broadcast(&PortEvent::Frame(packet)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "multiplexer lagged behind inbound frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => self.frames = None,
                },
                state = next_state(&mut self.states) => match state {
                    Ok(state) => self.broadcast(&PortEvent::State(state)),
                    Err(_) => self.states = None,
                },
            }
        }
        if let Some(mut messenger) = self.messenger.take() {
            messenger.shutdown().await;
        }
        info!("multiplexer stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { params, reply } => {
                let started = self.connect(&params);
                let _ = reply.send(started);
            }
            Command::Close { reply } => {
                let existed = match self.messenger.take() {
                    Some(mut messenger) => {
                        tokio::spawn(async move { messenger.shutdown().await });
                        true
                    }
                    None => false,
                };
                self.frames = None;
                self.states = None;
                if existed {
                    info!("socket closed by port");
                    self.broadcast(&PortEvent::State(ConnectionState::Closed));
                }
                let _ = reply.send(existed);
            }
            Command::Send {
                msg_type,
                payload,
                reply,
            } => {
                let messenger = self.ensure_messenger(&ConnectParams::default());
                let _ = reply.send(messenger.send_message(msg_type, payload.as_ref()));
            }
            Command::Register { reply } => {
                let (tx, events) = mpsc::channel(PORT_CAPACITY);
                self.next_port += 1;
                let id = self.next_port;
                let _ = tx.try_send(PortEvent::State(self.state()));
                self.ports.insert(id, tx);
                debug!(port = id, ports = self.ports.len(), "port registered");
                let _ = reply.send(Port { id, events });
            }
            Command::Unregister { id } => {
                if self.ports.remove(&id).is_some() {
                    debug!(port = id, ports = self.ports.len(), "port unregistered");
                }
            }
            Command::State { reply } => {
                let _ = reply.send(self.state());
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.messenger
            .as_ref()
            .map_or(ConnectionState::Idle, SocketMessenger::state)
    }

    fn ensure_messenger(&mut self, params: &ConnectParams) -> &mut SocketMessenger {
        let base = &self.base;
        let frames = &mut self.frames;
        let states = &mut self.states;
        self.messenger.get_or_insert_with(|| {
            let messenger = SocketMessenger::from_config(&params.apply(base));
            *frames = Some(messenger.subscribe());
            *states = Some(messenger.watch_state());
            messenger
        })
    }

    /// An idle or closed messenger is pointed at `params` before it opens,
    /// keeping frames sent ahead of the connect.
    fn connect(&mut self, params: &ConnectParams) -> bool {
        let options = SocketOptions::from(&params.apply(&self.base));
        let messenger = self.ensure_messenger(params);
        if messenger.state().is_active() {
            debug!("connect ignored, socket already active");
            return false;
        }
        messenger.set_options(options);
        messenger.connect();
        true
    }

    fn broadcast(&mut self, event: &PortEvent) {
        self.ports.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(port = id, "port queue full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(port = id, "port gone, removing");
                false
            }
        });
    }
}
