//! Hangar — MCP provider registry and gateway.
//!
//! Two subcommands:
//! - `hangar serve`: HTTP gateway (`POST /mcp`, `GET /healthz`)
//! - `hangar stdio`: STDIO transport for Claude Desktop and other
//!   STDIO-based MCP clients
//!
//! With no subcommand, `MCP_MODE` (stdio | http) picks the transport.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use hangar::server::http::run_http_server;
use hangar::server::stdio::run_stdio_server;
use hangar::{bootstrap, GatewayServer, HangarConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Hangar — MCP provider registry and gateway.
#[derive(Parser)]
#[command(
    name = "hangar",
    version,
    about = "Hangar — registry and gateway for MCP tool providers"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway exposing /mcp and /healthz
    Serve {
        /// Path to hangar.yaml [default: $MCP_CONFIG, ./hangar.yaml, or ~/.config/hangar/hangar.yaml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on [env: MCP_HTTP_PORT]
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind address [env: MCP_HTTP_HOST]
        #[arg(long)]
        host: Option<String>,
    },
    /// Bridge the gateway over STDIO (for Claude Desktop, etc.)
    Stdio {
        /// Path to hangar.yaml [default: $MCP_CONFIG, ./hangar.yaml, or ~/.config/hangar/hangar.yaml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logs to stderr; stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C handler — cancels the root token for graceful shutdown
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down hangar");
        cancel_for_signal.cancel();
    });

    let command = cli.command.unwrap_or_else(command_from_env);
    match command {
        Commands::Serve { config, port, host } => {
            let config = load_config(resolve_config(config))?;
            let host = host
                .or_else(|| std::env::var("MCP_HTTP_HOST").ok())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let port = port
                .or_else(|| {
                    std::env::var("MCP_HTTP_PORT")
                        .ok()
                        .and_then(|p| p.parse().ok())
                })
                .unwrap_or(8000);
            run_serve(config, host, port, cancel).await?;
        }
        Commands::Stdio { config } => {
            let config = load_config(resolve_config(config))?;
            run_stdio(config, cancel).await?;
        }
    }

    Ok(())
}

/// Map `MCP_MODE` to a subcommand when none was given.
fn command_from_env() -> Commands {
    match std::env::var("MCP_MODE").as_deref() {
        Ok("http") => Commands::Serve {
            config: None,
            port: None,
            host: None,
        },
        _ => Commands::Stdio { config: None },
    }
}

async fn run_serve(
    config: HangarConfig,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let ctx = bootstrap(config).map_err(|e| anyhow::anyhow!("failed to build runtime: {e}"))?;
    let workers = ctx.spawn_workers(&cancel);
    tracing::info!(providers = ?ctx.registry.ids().await, "hangar ready");

    let server = GatewayServer::new(ctx.clone());
    run_http_server(server, &host, port, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("http server error: {e}"))?;

    shutdown(ctx, workers).await;
    Ok(())
}

async fn run_stdio(config: HangarConfig, cancel: CancellationToken) -> Result<()> {
    let ctx = bootstrap(config).map_err(|e| anyhow::anyhow!("failed to build runtime: {e}"))?;
    let workers = ctx.spawn_workers(&cancel);
    tracing::info!(providers = ?ctx.registry.ids().await, "hangar ready");

    let server = GatewayServer::new(ctx.clone());
    run_stdio_server(server, cancel.clone()).await;
    cancel.cancel();

    shutdown(ctx, workers).await;
    Ok(())
}

async fn shutdown(ctx: std::sync::Arc<hangar::AppContext>, workers: Vec<tokio::task::JoinHandle<()>>) {
    ctx.shutdown_all_providers().await;
    for worker in workers {
        worker.abort();
    }
    tracing::info!("hangar stopped");
}

/// Resolve the config path: explicit flag → $MCP_CONFIG → ./hangar.yaml →
/// ~/.config/hangar/hangar.yaml.
fn resolve_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }
    if let Ok(path) = std::env::var("MCP_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let local = Path::new("hangar.yaml");
    if local.exists() {
        return Some(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("hangar").join("hangar.yaml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    None
}

/// Load the config file, or fall back to an empty registry when none is
/// found — the gateway still serves health and continuation tools.
fn load_config(path: Option<PathBuf>) -> Result<HangarConfig> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            HangarConfig::from_file(&path)
                .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))
        }
        None => {
            tracing::warn!("no hangar.yaml found; starting with an empty provider registry");
            Ok(HangarConfig::default())
        }
    }
}
