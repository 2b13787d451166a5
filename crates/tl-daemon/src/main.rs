//! Termlink Daemon
//!
//! Hosts the session core and serves it to local front-ends over a
//! loopback IPC socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tl_core::config::{self, DaemonConfig};
use tl_daemon::IpcServer;
use tl_session::SessionHub;

#[derive(Parser)]
#[command(name = "tl-daemon")]
#[command(about = "Termlink session daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TERMLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config, must be loopback)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_result = load(&args);

    // Initialize logging
    let log_level = match (&args.log_level, &config_result) {
        _ if args.foreground => "debug".to_string(),
        (Some(level), _) => level.clone(),
        (None, Ok(config)) => config.log_level.clone(),
        (None, Err(_)) => "info".to_string(),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(log_level),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Termlink daemon starting...");
    let mut config = config_result?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if !config.is_loopback() {
        bail!(
            "Refusing to listen on {}: the daemon only binds loopback addresses",
            config.bind_address
        );
    }

    let hub = Arc::new(SessionHub::with_russh(config.session.clone()));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let server = IpcServer::new(config.bind_address.clone(), Arc::clone(&hub))
        .with_shutdown_token(cancel.clone());
    let result = server.run().await;

    tracing::info!("Closing sessions...");
    hub.shutdown().await;

    result?;
    tracing::info!("Daemon shutdown complete");
    Ok(())
}

fn load(args: &Args) -> Result<DaemonConfig> {
    if let Some(config_path) = &args.config {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            eprintln!("Failed to load config from {:?}: {}", default_path, e);
            DaemonConfig::default()
        }))
    } else {
        Ok(DaemonConfig::default())
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}
