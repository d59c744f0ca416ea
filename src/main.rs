//! wshub server binary
//!
//! Runs the WebSocket server core standalone with a JSON "action"
//! command resolver and a couple of built-in demo commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use wshub::{CommandRouter, JsonFieldResolver, ServerConfig, SocketServer};

/// wshub server
///
/// Standalone WebSocket server with command dispatch
#[derive(Parser, Debug)]
#[command(name = "wshub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("wshub v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let server = SocketServer::new(config).with_resolver(JsonFieldResolver::default());
    let registry = server.registry();

    // Demo commands: {"action":"ping"} answers the sender,
    // {"action":"chat",...} relays the raw message to every client.
    let commands = CommandRouter::new()
        .with_command("ping", |connection, _raw| {
            connection.send_text(json!({ "type": "pong" }).to_string())?;
            Ok(None)
        })
        .with_command("chat", move |_connection, raw| {
            let delivered = registry.broadcast_text(raw);
            Ok(Some(json!({ "delivered": delivered })))
        });

    let server = Arc::new(server.with_commands(commands));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.stop();
    });

    server.start().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
