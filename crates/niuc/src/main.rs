#![forbid(unsafe_code)]

use niuc::api::{self, LoginParam};
use niuc::config::{load_config, Cli, ClientConfig, Commands};
use niuc::cookies::CookieJar;
use niuc::http::{Body, HttpClient, HttpResponse, RequestContext, RequestOptions};
use niuc::local_api;
use niuc::multiplexer::Multiplexer;
use niuc::session::{ensure_client_id, SessionStore};

use base64::Engine;
use clap::Parser;
use reqwest::Method;
use serde_json::{Map, Value};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Resolve path for niuc data files (cookies.toml).
/// Checks platform-native data dir first, then falls back to ~/.config/niuc/.
fn resolve_data_path(filename: &str) -> PathBuf {
    let native = dirs::data_dir().map(|d| d.join("niuc").join(filename));
    let xdg = dirs::home_dir().map(|d| d.join(".config").join("niuc").join(filename));

    if let Some(p) = native.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    if let Some(p) = xdg.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    native.unwrap_or_else(|| PathBuf::from(filename))
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref base_url) = cli.base_url {
        config.api.base_url.clone_from(base_url);
    }
    if let Some(ref listen) = cli.listen {
        config.listen.clone_from(listen);
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

/// Context over the persisted cookie jar.
fn cookie_context(config: &ClientConfig) -> anyhow::Result<RequestContext> {
    let jar = CookieJar::load(resolve_data_path("cookies.toml"))?;
    ensure_client_id(&jar, &config.api.platform);
    Ok(RequestContext::new(Arc::new(jar)))
}

/// `key=value` pairs as a JSON object; values that parse as JSON keep
/// their type.
fn parse_query(pairs: &[String]) -> anyhow::Result<Option<Value>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut map = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("query parameter must be key=value, got: {pair}"))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
        map.insert(key.to_string(), value);
    }
    Ok(Some(Value::Object(map)))
}

fn parse_json_arg(arg: Option<&str>) -> anyhow::Result<Option<Value>> {
    arg.map(serde_json::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid JSON argument: {e}"))
}

fn print_response(resp: &HttpResponse) -> anyhow::Result<()> {
    match &resp.body {
        Body::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
        Body::Text(text) => println!("{text}"),
        Body::Bytes(bytes) => {
            println!("{}", base64::engine::general_purpose::STANDARD.encode(bytes));
        }
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Daemon ──────────────────────────────────────────────────────────

async fn run_daemon(config: ClientConfig) -> anyhow::Result<()> {
    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ niu client{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}Socket{RESET}     {}", config.socket.url);
        eprintln!("  {DIM}Listen{RESET}     {}", config.listen);
        eprintln!();
    }

    info!(socket = %config.socket.url, listen = %config.listen, "starting niuc socket daemon");

    let (mux, mux_handle) = Multiplexer::spawn(config.socket.clone());

    let api_handle = tokio::spawn({
        let listen = config.listen.clone();
        async move {
            if let Err(e) = local_api::start_local_api(&listen, mux).await {
                error!("Local API error: {}", e);
            }
        }
    });

    tokio::select! {
        _ = mux_handle => {
            info!("Multiplexer exited");
        }
        _ = api_handle => {
            info!("Local API server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

// ── Daemon IPC ──────────────────────────────────────────────────────

async fn exchange<S>(stream: S, cmd: &str) -> anyhow::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    writer.write_all(cmd.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(line)
}

async fn daemon_cmd(listen: &str, cmd: &str) -> anyhow::Result<String> {
    let result = if let Some(path) = listen.strip_prefix("unix://") {
        match tokio::net::UnixStream::connect(path).await {
            Ok(stream) => return exchange(stream, cmd).await,
            Err(e) => e,
        }
    } else {
        let addr = listen.strip_prefix("tcp://").unwrap_or(listen);
        match tokio::net::TcpStream::connect(addr).await {
            Ok(stream) => return exchange(stream, cmd).await,
            Err(e) => e,
        }
    };

    if tty() {
        eprintln!();
        eprintln!("  {RED}✗{RESET} Could not connect to daemon");
        eprintln!("    {DIM}{result}{RESET}");
        eprintln!();
        eprintln!("    Is the daemon running? Try: {BOLD}niuc socket{RESET}");
        eprintln!();
    } else {
        eprintln!("Failed to connect to daemon: {result}");
    }
    std::process::exit(1);
}

fn fmt_send(json: &Value) {
    match (json["status"].as_str(), json["error"].as_str()) {
        (Some("queued"), _) => {
            let id = json["request_id"].as_u64().unwrap_or(0);
            println!("  {GREEN}✓{RESET} Queued {DIM}(request {id}){RESET}");
        }
        (_, Some(msg)) => println!("  {RED}✗{RESET} {msg}"),
        _ => println!("  {RED}✗{RESET} Send failed"),
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Failed to install rustls crypto provider - may already be installed or unsupported platform");
    }

    let cli = Cli::parse();

    init_tracing(&cli)?;

    let config = resolve_config(&cli)?;

    match &cli.command {
        Commands::Socket => run_daemon(config).await?,

        Commands::Send { msg_type, payload } => {
            let payload = parse_json_arg(payload.as_deref())?;
            let cmd = serde_json::json!({
                "cmd": "send",
                "msg_type": msg_type,
                "payload": payload,
            });
            let resp = daemon_cmd(&config.listen, &cmd.to_string()).await?;

            if tty() {
                let json: Value = serde_json::from_str(resp.trim())?;
                fmt_send(&json);
            } else {
                print!("{resp}");
            }
        }

        Commands::Session => {
            let ctx = cookie_context(&config)?;
            let secrets = SessionStore::new(config.cookies.max_age_s).ensure(ctx.jar());
            if tty() {
                println!("  {DIM}Session{RESET}    {CYAN}{}{RESET}", secrets.session_id);
            } else {
                println!("{}", secrets.session_id);
            }
        }

        Commands::Get { path, query } => {
            let ctx = cookie_context(&config)?;
            let client = HttpClient::new(&config)?;
            let query = parse_query(query)?;
            let resp = client
                .request(
                    &ctx,
                    Method::GET,
                    path,
                    None,
                    query.as_ref(),
                    RequestOptions::default(),
                )
                .await?;
            print_response(&resp)?;
        }

        Commands::Post { path, body } => {
            let ctx = cookie_context(&config)?;
            let client = HttpClient::new(&config)?;
            let body = parse_json_arg(body.as_deref())?;
            let resp = client
                .request(
                    &ctx,
                    Method::POST,
                    path,
                    body.as_ref(),
                    None,
                    RequestOptions::default(),
                )
                .await?;
            print_response(&resp)?;
        }

        Commands::Login {
            phone,
            code,
            secure_code,
        } => {
            let ctx = cookie_context(&config)?;
            let client = HttpClient::new(&config)?;
            let param = LoginParam {
                phone: phone.clone(),
                code: code.clone(),
                secure_code: secure_code.clone(),
            };
            let dto = api::login(&client, &ctx, &param).await?;
            if dto.is_succeed() {
                println!("  {GREEN}✓{RESET} Logged in");
            } else {
                println!("  {RED}✗{RESET} Login rejected: {} ({})", dto.msg, dto.code);
            }
        }

        Commands::Logout => {
            let ctx = cookie_context(&config)?;
            let client = HttpClient::new(&config)?;
            api::logout(&client, &ctx).await?;
            println!("  {GREEN}✓{RESET} Logged out");
        }

        Commands::User => {
            let ctx = cookie_context(&config)?;
            let client = HttpClient::new(&config)?;
            let dto = api::user_info(&client, &ctx).await?;
            print_json(&dto)?;
        }
    }

    Ok(())
}
