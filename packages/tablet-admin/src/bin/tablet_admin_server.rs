//! tablet-admin-server - Unix socket server for the table admin protocol
//!
//! Usage:
//!   tablet-admin-server [--config server.yaml] [--socket /tmp/tablet-admin.sock]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tablet_admin::catalog::TableManager;
use tablet_admin::config::ServerConfig;
use tablet_admin::server;

#[derive(Parser, Debug)]
#[command(name = "tablet-admin-server", version, about = "Tablet store admin server")]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Unix socket path (overrides the config file)
    #[arg(short = 's', long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Delay before online/offline requests take effect, in milliseconds
    #[arg(long, value_name = "MS")]
    transition_delay_ms: Option<u64>,

    /// Log filter directive, e.g. "info" or "tablet_admin=debug"
    #[arg(long)]
    log_filter: Option<String>,
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if let Some(delay) = args.transition_delay_ms {
        config.transition_delay_ms = delay;
    }
    if let Some(filter) = &args.log_filter {
        config.log_filter = filter.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config);

    tracing::info!("starting tablet-admin-server v{}", env!("CARGO_PKG_VERSION"));

    // Remove stale socket file
    let _ = std::fs::remove_file(&config.socket_path);

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind socket {}", config.socket_path.display()))?;
    tracing::info!("listening on {}", config.socket_path.display());

    let manager = Arc::new(TableManager::from_config(&config));

    let socket_path = config.socket_path.clone();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("Failed to register signal handlers")?;

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!("received signal {}, shutting down", sig);
            let _ = std::fs::remove_file(&socket_path);
            std::process::exit(0);
        }
    });

    server::serve(listener, manager, config.max_frame_bytes);
    Ok(())
}
