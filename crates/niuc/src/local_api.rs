use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use niu_common::packet::{PacketProtocol, ResponsePacket};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::multiplexer::{ConnectParams, Multiplexer, PortEvent};

/// Maximum command line length (1 MB). Prevents unbounded memory allocation
/// from a misbehaving local process sending an enormous line.
const MAX_CMD_LEN: usize = 1_048_576;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd")]
enum ApiCommand {
    #[serde(rename = "connect")]
    Connect {
        #[serde(default)]
        data: ConnectParams,
    },
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "send")]
    Send {
        msg_type: u16,
        #[serde(default)]
        payload: Option<Value>,
    },
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "subscribe")]
    Subscribe,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectResponse {
    status: &'static str,
    started: bool,
}

#[derive(Debug, Clone, Serialize)]
struct SendResponse {
    status: &'static str,
    request_id: u32,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    state: &'static str,
}

/// JSON line for one port event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum EventLine {
    State {
        state: &'static str,
    },
    Frame {
        msg_type: u16,
        request_id: u32,
        timestamp: u64,
        code: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload_b64: Option<String>,
    },
}

impl EventLine {
    fn from_event(event: &PortEvent) -> Self {
        match event {
            PortEvent::State(state) => Self::State {
                state: state.as_str(),
            },
            PortEvent::Frame(packet) => frame_line(packet),
        }
    }
}

/// Renders a frame, decoding a MessagePack payload to JSON when possible.
fn frame_line(packet: &ResponsePacket) -> EventLine {
    let (payload, payload_b64) =
        match PacketProtocol::msgpack().decode_payload::<Value>(&packet.payload) {
            Ok(value) => (value, None),
            Err(_) => (None, Some(BASE64.encode(&packet.payload))),
        };
    EventLine::Frame {
        msg_type: packet.meta.msg_type,
        request_id: packet.meta.request_id,
        timestamp: packet.meta.timestamp,
        code: packet.meta.code,
        payload,
        payload_b64,
    }
}

fn json_line<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)? + "\n")
}

fn error_line(error: impl std::fmt::Display) -> anyhow::Result<String> {
    json_line(&serde_json::json!({"error": error.to_string()}))
}

/// Serves the port API on `tcp://addr:port` or `unix://path`.
///
/// # Errors
///
/// Returns an error if binding the local API listener fails.
pub async fn start_local_api(listen: &str, mux: Multiplexer) -> anyhow::Result<()> {
    if let Some(path) = listen.strip_prefix("unix://") {
        let listener = tokio::net::UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("Local API listening on unix socket: {}", path);

        loop {
            let (stream, _) = listener.accept().await?;
            let mux = mux.clone();
            let (reader, writer) = stream.into_split();

            tokio::spawn(async move {
                if let Err(e) = handle_local_client(reader, writer, mux).await {
                    debug!("Client handler error: {}", e);
                }
            });
        }
    } else if let Some(addr) = listen.strip_prefix("tcp://") {
        let listener = TcpListener::bind(addr).await?;
        info!("Local API listening on TCP: {}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let mux = mux.clone();
            let (reader, writer) = stream.into_split();

            tokio::spawn(async move {
                if let Err(e) = handle_local_client(reader, writer, mux).await {
                    debug!("Client handler error: {}", e);
                }
            });
        }
    } else {
        anyhow::bail!(
            "Invalid listen address format: {listen}. Use unix://path or tcp://addr:port"
        );
    }
}

async fn handle_local_client<R, W>(reader: R, mut writer: W, mux: Multiplexer) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_CMD_LEN as u64 + 1);
        match tokio::io::AsyncBufReadExt::read_line(&mut limited, &mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        if line.len() > MAX_CMD_LEN {
            let error = error_line(format!(
                "command exceeds maximum length ({MAX_CMD_LEN} bytes)"
            ))?;
            writer.write_all(error.as_bytes()).await?;
            continue;
        }

        let cmd: ApiCommand = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                writer.write_all(error_line(e)?.as_bytes()).await?;
                continue;
            }
        };

        let response = match cmd {
            ApiCommand::Connect { data } => match mux.connect_socket(data).await {
                Ok(started) => json_line(&ConnectResponse {
                    status: "connecting",
                    started,
                })?,
                Err(e) => error_line(e)?,
            },
            ApiCommand::Close => match mux.close_socket().await {
                Ok(existed) => json_line(&serde_json::json!({
                    "status": "closed", "existed": existed
                }))?,
                Err(e) => error_line(e)?,
            },
            ApiCommand::Send { msg_type, payload } => {
                match mux.send_socket_message(msg_type, payload).await {
                    Ok(request_id) => json_line(&SendResponse {
                        status: "queued",
                        request_id,
                    })?,
                    Err(e) => error_line(e)?,
                }
            }
            ApiCommand::Status => match mux.state().await {
                Ok(state) => json_line(&StatusResponse {
                    state: state.as_str(),
                })?,
                Err(e) => error_line(e)?,
            },
            ApiCommand::Subscribe => {
                handle_subscribe(&mux, &mut writer).await?;
                return Ok(());
            }
        };

        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

async fn handle_subscribe<W>(mux: &Multiplexer, writer: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut port = mux.register().await?;
    debug!(port = port.id, "subscriber attached");
    while let Some(event) = port.events.recv().await {
        let line = json_line(&EventLine::from_event(&event))?;
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    mux.unregister(port.id).await;
    Ok(())
}
