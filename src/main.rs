//! # bidi-sse
//!
//! Command-line front end: an echo server and an interactive client.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use bidi_client::{ClientEvent, ClientEventKind, ClientOptions, ClientTransport};
use bidi_server::{
    load_config_from_path, BidiServer, ServerConfig, ServerEvent, ServerEventKind, SessionEvent,
    SessionEventKind,
};
use bidi_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

/// Bidirectional messaging over Server-Sent Events.
#[derive(Parser, Debug)]
#[command(name = "bidi-sse", version, about)]
struct Cli {
    /// Log output format (`pretty` or `json`).
    #[arg(long, global = true, env = "BIDI_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an echo server: every message is sent back to its peer.
    Serve(ServeArgs),
    /// Connect to a server; stdin lines are sent, messages are printed.
    Connect {
        /// Stream URL, e.g. `http://127.0.0.1:8080/bidi-sse`.
        url: String,
    },
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// JSON config file; missing file means defaults.
    #[arg(long, default_value = "bidi-sse.json")]
    config: PathBuf,

    /// Host to bind (overrides the config file).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Base path of the endpoint.
    #[arg(long)]
    path: Option<String>,

    /// Send `access-control-allow-origin: *`.
    #[arg(long)]
    cors: bool,
}

impl ServeArgs {
    fn load(&self) -> Result<ServerConfig> {
        let mut config = load_config_from_path(&self.config)
            .with_context(|| format!("Failed to load config from {}", self.config.display()))?;
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.path {
            config.base_path.clone_from(path);
        }
        if self.cors {
            config.cors = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..TelemetryConfig::default()
    })
    .context("Failed to initialize logging")?;

    match cli.command {
        Command::Serve(args) => serve(&args).await,
        Command::Connect { url } => connect(&url).await,
    }
}

async fn serve(args: &ServeArgs) -> Result<()> {
    let config = args.load()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.host, config.port))?;

    let server = BidiServer::new(config).context("Invalid server configuration")?;
    install_echo(&server);

    let app = server
        .attach(Router::new().route("/health", get(|| async { "ok" })))
        .layer(TraceLayer::new_for_http());
    let handle = server
        .listen_with(addr, app)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %handle.local_addr(), "echo server running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!(sessions = server.sessions().len(), "shutting down");
    handle.shutdown().await;
    Ok(())
}

fn install_echo(server: &BidiServer) {
    let _ = server.on(ServerEventKind::Connection, |event| {
        let ServerEvent::Connection(session) = event else {
            return;
        };

        let peer = Arc::downgrade(session);
        let _ = session.on(SessionEventKind::Message, move |event| {
            if let (SessionEvent::Message(value), Some(peer)) = (event, peer.upgrade()) {
                let _ = peer.send(value);
            }
        });
        let id = session.id().clone();
        let _ = session.on(SessionEventKind::Error, move |event| {
            if let SessionEvent::Error(e) = event {
                warn!(session_id = %id, error = %e, "session error");
            }
        });
    });
}

async fn connect(url: &str) -> Result<()> {
    let transport = ClientTransport::new(url, ClientOptions::default())
        .with_context(|| format!("Failed to create transport for {url}"))?;
    let (closed_tx, mut closed_rx) = tokio::sync::watch::channel(false);

    let _ = transport.on(ClientEventKind::Open, |_| info!("connected"));
    let _ = transport.on(ClientEventKind::Message, |event| {
        if let ClientEvent::Message(value) = event {
            println!("{value}");
        }
    });
    let _ = transport.on(ClientEventKind::Error, |event| {
        if let ClientEvent::Error(e) = event {
            warn!(error = %e, "transport error");
        }
    });
    let _ = transport.on(ClientEventKind::Close, move |_| {
        let _ = closed_tx.send(true);
    });
    transport.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = closed_rx.changed() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let value = serde_json::from_str(&line).unwrap_or(Value::String(line));
                if let Err(e) = transport.send(&value) {
                    warn!(error = %e, "message not sent");
                }
            }
        }
    }

    transport.close();
    Ok(())
}
