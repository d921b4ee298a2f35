use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the niu client.
#[derive(Parser)]
#[command(name = "niuc", about = "niu signed HTTP and socket client")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// API base URL override.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Local port API listen address override.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Signed GET request; prints the response body.
    Get {
        /// Request path, e.g. `/v1/user/info`.
        path: String,
        /// Query parameters as `key=value`.
        #[arg(short, long = "query")]
        query: Vec<String>,
    },
    /// Signed POST request with an optional JSON body.
    Post {
        /// Request path.
        path: String,
        /// JSON body.
        body: Option<String>,
    },
    /// Log in with phone and SMS code.
    Login {
        /// Phone number in international format.
        phone: String,
        /// SMS verification code.
        code: String,
        /// Secure code issued alongside the SMS.
        #[arg(long, default_value = "")]
        secure_code: String,
    },
    /// Log out and clear stored tokens.
    Logout,
    /// Show the logged-in user.
    User,
    /// Print the session id, creating session keys if needed.
    Session,
    /// Run the socket multiplexer and local port API.
    Socket,
    /// Send a packet through a running `niuc socket` daemon.
    Send {
        /// Message type.
        msg_type: u16,
        /// JSON payload.
        payload: Option<String>,
    },
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Signed HTTP API settings.
    pub api: ApiConfig,
    /// 5xx retry settings.
    pub retry: RetryConfig,
    /// Cookie names and lifetimes.
    pub cookies: CookieConfig,
    /// Persistent socket settings.
    pub socket: SocketConfig,
    /// Local port API listen address (`tcp://` or `unix://`).
    pub listen: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            retry: RetryConfig::default(),
            cookies: CookieConfig::default(),
            socket: SocketConfig::default(),
            listen: "tcp://127.0.0.1:7710".to_string(),
        }
    }
}

/// Signed HTTP API settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Base URL all request paths are joined to.
    pub base_url: String,
    /// Platform identifier sent as `x-platform`.
    pub platform: String,
    /// Per-attempt timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Encrypt POST/PUT bodies.
    pub encryption: bool,
    /// Token refresh endpoint.
    pub refresh_path: String,
    /// Login page used for redirects after unrecoverable 401s.
    pub login_path: String,
    /// How long a settled refresh keeps serving late 401s, in milliseconds.
    pub refresh_hold_ms: u64,
    /// Server Ed25519 verifying key (base64).
    pub server_sign_key: String,
    /// Server X25519 public key (base64).
    pub server_box_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.niu.local".to_string(),
            platform: niu_common::types::DEFAULT_PLATFORM.to_string(),
            timeout_ms: 10_000,
            encryption: true,
            refresh_path: "/v1/auth/refresh".to_string(),
            login_path: "/login".to_string(),
            refresh_hold_ms: 5_000,
            server_sign_key: String::new(),
            server_box_key: String::new(),
        }
    }
}

impl ApiConfig {
    /// Per-attempt timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Refresh hold window.
    #[must_use]
    pub const fn refresh_hold(&self) -> Duration {
        Duration::from_millis(self.refresh_hold_ms)
    }
}

/// Linear retry for transient 5xx responses.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay unit; the n-th retry waits `n * base_delay_ms`.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
        }
    }
}

/// Cookie names and lifetimes.
#[derive(Debug, Deserialize, Clone)]
pub struct CookieConfig {
    /// Access token cookie name.
    pub access_token: String,
    /// Refresh token cookie name.
    pub refresh_token: String,
    /// Max-age of the session key cookies, in seconds.
    pub max_age_s: u64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            access_token: niu_common::types::cookie::ACCESS_TOKEN.to_string(),
            refresh_token: niu_common::types::cookie::REFRESH_TOKEN.to_string(),
            max_age_s: 60 * 60 * 24 * 365,
        }
    }
}

/// Persistent socket settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SocketConfig {
    /// WebSocket URL.
    pub url: String,
    /// Offered `Sec-WebSocket-Protocol` values.
    pub subprotocols: Vec<String>,
    /// Heartbeat period while open, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Base reconnect delay, in milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.niu.local/ws".to_string(),
            subprotocols: Vec::new(),
            heartbeat_interval_ms: 30_000,
            reconnect_base_ms: 1_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(format!(
                "api.base_url must start with http:// or https://, got: {}",
                self.api.base_url
            ));
        }
        for (name, path) in [
            ("api.refresh_path", &self.api.refresh_path),
            ("api.login_path", &self.api.login_path),
        ] {
            if !path.starts_with('/') {
                return Err(format!("{name} must start with /, got: {path}"));
            }
        }
        if self.api.platform.is_empty() {
            return Err("api.platform must not be empty".to_string());
        }
        if self.api.timeout_ms == 0 {
            return Err("api.timeout_ms must be greater than 0".to_string());
        }
        if !self.api.server_sign_key.is_empty()
            && niu_common::crypto::verifying_key_from_base64(&self.api.server_sign_key).is_err()
        {
            return Err("api.server_sign_key must be a base64 Ed25519 public key".to_string());
        }
        if !self.api.server_box_key.is_empty()
            && niu_common::crypto::box_public_from_base64(&self.api.server_box_key).is_err()
        {
            return Err("api.server_box_key must be a base64 X25519 public key".to_string());
        }

        if self.retry.base_delay_ms == 0 {
            return Err("retry.base_delay_ms must be greater than 0".to_string());
        }

        if self.cookies.access_token.is_empty() || self.cookies.refresh_token.is_empty() {
            return Err("cookie names must not be empty".to_string());
        }

        if !(self.socket.url.starts_with("ws://") || self.socket.url.starts_with("wss://")) {
            return Err(format!(
                "socket.url must start with ws:// or wss://, got: {}",
                self.socket.url
            ));
        }
        if self.socket.heartbeat_interval_ms == 0 {
            return Err("socket.heartbeat_interval_ms must be greater than 0".to_string());
        }
        if self.socket.reconnect_base_ms == 0 {
            return Err("socket.reconnect_base_ms must be greater than 0".to_string());
        }

        if !(self.listen.starts_with("tcp://") || self.listen.starts_with("unix://")) {
            return Err(format!(
                "listen address must start with tcp:// or unix://, got: {}",
                self.listen
            ));
        }

        Ok(())
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let d = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("api.base_url", d.api.base_url.as_str())?
        .set_default("api.platform", d.api.platform.as_str())?
        .set_default("api.timeout_ms", d.api.timeout_ms as i64)?
        .set_default("api.encryption", d.api.encryption)?
        .set_default("api.refresh_path", d.api.refresh_path.as_str())?
        .set_default("api.login_path", d.api.login_path.as_str())?
        .set_default("api.refresh_hold_ms", d.api.refresh_hold_ms as i64)?
        .set_default("api.server_sign_key", d.api.server_sign_key.as_str())?
        .set_default("api.server_box_key", d.api.server_box_key.as_str())?
        .set_default("retry.max_retries", i64::from(d.retry.max_retries))?
        .set_default("retry.base_delay_ms", d.retry.base_delay_ms as i64)?
        .set_default("cookies.access_token", d.cookies.access_token.as_str())?
        .set_default("cookies.refresh_token", d.cookies.refresh_token.as_str())?
        .set_default("cookies.max_age_s", d.cookies.max_age_s as i64)?
        .set_default("socket.url", d.socket.url.as_str())?
        .set_default("socket.subprotocols", Vec::<String>::new())?
        .set_default(
            "socket.heartbeat_interval_ms",
            d.socket.heartbeat_interval_ms as i64,
        )?
        .set_default("socket.reconnect_base_ms", d.socket.reconnect_base_ms as i64)?
        .set_default(
            "socket.max_reconnect_attempts",
            i64::from(d.socket.max_reconnect_attempts),
        )?
        .set_default("listen", d.listen.as_str())?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Platform-native config dir first, then ~/.config/niuc/
        let native_path = dirs::config_dir().map(|d| d.join("niuc").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("niuc").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    // NIUC_API__BASE_URL -> api.base_url; field names contain underscores
    builder = builder.add_source(
        config::Environment::with_prefix("NIUC")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;

    fn valid() -> ClientConfig {
        ClientConfig::default()
    }

    #[test]
    fn test_load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")))
            .expect("load_config should succeed with no file");

        assert_eq!(config.api.base_url, "https://api.niu.local");
        assert_eq!(config.api.platform, "8");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.api.refresh_hold_ms, 5_000);
        assert_eq!(config.socket.max_reconnect_attempts, 5);
        assert!(config.socket.subprotocols.is_empty());
        assert_eq!(config.listen, "tcp://127.0.0.1:7710");
    }

    #[test]
    fn test_load_config_reads_toml_file() {
        let dir = std::env::temp_dir().join(format!("niuc-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "[api]\nbase_url = \"http://127.0.0.1:9000\"\nencryption = false\n\n\
             [socket]\nsubprotocols = [\"niu.v1\"]\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.api.base_url, "http://127.0.0.1:9000");
        assert!(!config.api.encryption);
        assert_eq!(config.socket.subprotocols, vec!["niu.v1".to_string()]);
        assert_eq!(config.api.timeout_ms, 10_000, "untouched keys keep defaults");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_default_config_passes_validation() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_http_base_url() {
        let mut config = valid();
        config.api.base_url = "ftp://example.com".to_string();
        assert!(config.validate().unwrap_err().contains("api.base_url"));
    }

    #[test]
    fn test_validate_rejects_relative_refresh_path() {
        let mut config = valid();
        config.api.refresh_path = "v1/auth/refresh".to_string();
        assert!(config.validate().unwrap_err().contains("refresh_path"));
    }

    #[test]
    fn test_validate_rejects_bad_server_key() {
        let mut config = valid();
        config.api.server_sign_key = "c2hvcnQ=".to_string();
        assert!(config.validate().unwrap_err().contains("server_sign_key"));
    }

    #[test]
    fn test_validate_rejects_zero_retry_delay() {
        let mut config = valid();
        config.retry.base_delay_ms = 0;
        assert!(config.validate().unwrap_err().contains("base_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_invalid_socket_scheme() {
        let mut config = valid();
        config.socket.url = "http://example.com".to_string();
        assert!(config.validate().unwrap_err().contains("ws://"));
    }

    #[test]
    fn test_validate_rejects_zero_heartbeat() {
        let mut config = valid();
        config.socket.heartbeat_interval_ms = 0;
        assert!(config.validate().unwrap_err().contains("heartbeat"));
    }

    #[test]
    fn test_validate_accepts_unix_listen() {
        let mut config = valid();
        config.listen = "unix:///tmp/niuc.sock".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_invalid_listen_scheme() {
        let mut config = valid();
        config.listen = "http://127.0.0.1:7710".to_string();
        assert!(config.validate().unwrap_err().contains("tcp://"));
    }
}
