//! imx-gateway: WebSocket edge node of the imx messaging system.
//!
//! Accepts client WebSocket connections, runs the session handshake, routes
//! backend traffic to sessions and rooms, and relays client traffic to the
//! backend over a pool of forwarder links.

mod chat;
mod config;
mod conn;
mod handlers;
mod kick;
mod reporter;
mod router;
mod server;
mod shard;
mod transport;

use clap::Parser;
use config::GatewayConfig;
use server::Gateway;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

/// imx-gateway — WebSocket edge gateway
#[derive(Parser, Debug)]
#[command(name = "imx-gateway", version, about = "imx WebSocket edge gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Node id of this gateway
    #[arg(long)]
    nid: Option<u32>,

    /// Backend forwarder address (host:port)
    #[arg(long)]
    forwarder: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.imx/gateway.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting imx-gateway");

    // Load gateway config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let conf = match GatewayConfig::load(
        Some(&config_path),
        cli.port,
        cli.nid,
        cli.forwarder.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(conf.listen_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %conf.listen_addr(), error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let gateway = Gateway::new(conf);

    // Run until shutdown signal
    tokio::select! {
        result = gateway.clone().run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "gateway error");
                gateway.shutdown().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    gateway.shutdown().await;
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
