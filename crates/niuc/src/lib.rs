//! niu client: signed and sealed HTTP requests with transparent token
//! renewal, and a reconnecting packet socket shared by local consumers.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Account endpoint wrappers.
pub mod api;
/// Observable re-runnable fetches.
pub mod async_data;
/// CLI parsing and layered configuration.
pub mod config;
/// Cookie model and jar.
pub mod cookies;
/// Error enums for every layer.
pub mod error;
/// Signed request pipeline.
pub mod http;
/// Line-delimited JSON port API over TCP/Unix sockets.
pub mod local_api;
/// Packet framing, pings and call correlation over the socket.
pub mod messenger;
/// One socket fanned out to many ports.
pub mod multiplexer;
/// Single-flight token refresh slot.
pub mod refresh;
/// Retry and reconnect delay strategies.
pub mod retry;
/// Session key material kept in cookies.
pub mod session;
/// Reconnecting WebSocket engine.
pub mod socket;
/// Access and refresh token cookies.
pub mod tokens;
