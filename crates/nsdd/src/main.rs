//! nsdd — the network service discovery daemon.
//!
//! # Usage
//!
//! ```bash
//! nsdd                          # Start with the default config
//! nsdd --socket /run/nsd.sock   # Use a specific client socket
//! nsdd --interface wlan0        # Restrict the modern engine to one link
//! ```
//!
//! On first run a config file with defaults is written to
//! `~/.config/nsdd/config.toml`; the backend feature flags live there.
//!
//! # Architecture
//!
//! The daemon spawns several concurrent tasks:
//! 1. The state machine (one task owning every registry)
//! 2. IPC server on a Unix socket (accept loop + one task per client)
//! 3. Legacy helper daemon pumps (spawned lazily on first legacy request)
//! 4. Modern engine browse pumps (mdns-sd background thread + bridges)
//! 5. A Wi-Fi link watcher feeding the multicast lock manager

mod app;
mod clients;
mod engine;
mod eventlog;
mod ipc_server;
mod legacy;
mod links;
mod lock;
mod offload;
mod router;

use anyhow::{Context, Result};
use app::{AppMessage, NsdService};
use clap::Parser;
use engine::MdnsSdEngine;
use ipc_server::IpcServer;
use legacy::MdnsdBackend;
use links::NetdevLinkProvider;
use lock::{LockManager, LoggingMulticastLock};
use nsd_core::config::DaemonConfig;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// How often the Wi-Fi link set is re-scanned for the lock manager.
const LINK_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// nsdd — network service discovery daemon.
#[derive(Parser, Debug)]
#[command(name = "nsdd", about = "Network service discovery daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the Unix socket clients connect to.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to the legacy helper daemon's control socket.
    #[arg(long)]
    mdnsd_socket: Option<PathBuf>,

    /// Restrict the modern mDNS engine to this network interface.
    #[arg(short, long)]
    interface: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The NSDD_LOG env var controls the log level (default: info).
    // Logs go to both stderr and a log file in the data directory.
    init_logging();

    // -----------------------------------------------------------------------
    // Load or create configuration
    // -----------------------------------------------------------------------
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => DaemonConfig::config_file_path().context("could not determine config directory")?,
    };

    let (mut config, created) = DaemonConfig::load_or_init(&config_path)?;
    if created {
        info!(path = %config_path.display(), "first run, wrote default config");
    } else {
        info!(path = %config_path.display(), "loaded config");
    }

    // CLI overrides
    if let Some(path) = &cli.mdnsd_socket {
        config.mdnsd_socket = Some(path.clone());
    }
    if let Some(interface) = &cli.interface {
        config.network_interface = Some(interface.clone());
    }

    // -----------------------------------------------------------------------
    // Wire the state machine and its backends together
    // -----------------------------------------------------------------------
    let (app_tx, app_rx) = mpsc::unbounded_channel::<AppMessage>();

    let engine = MdnsSdEngine::new(app_tx.clone(), config.network_interface.as_deref())
        .context("failed to start the mDNS engine")?;
    let legacy = MdnsdBackend::new(config.mdnsd_socket_path(), app_tx.clone());

    let mut service = NsdService::new(
        &config,
        Box::new(legacy),
        Box::new(engine),
        Box::new(NetdevLinkProvider),
        LockManager::new(Box::new(LoggingMulticastLock)),
        app_tx.clone(),
    );

    // -----------------------------------------------------------------------
    // Start the IPC server
    // -----------------------------------------------------------------------
    let socket_path = match &cli.socket {
        Some(path) => path.clone(),
        None => DaemonConfig::default_socket_path(),
    };
    let ipc_server = IpcServer::bind(&socket_path)
        .await
        .context("failed to start IPC server")?;

    tokio::spawn(ipc_server.accept_loop(app_tx.clone()));

    // -----------------------------------------------------------------------
    // Wi-Fi link watcher: feeds the multicast lock manager
    // -----------------------------------------------------------------------
    {
        let initial = links::scan_wifi_lock_required();
        links::log_wifi_links(&initial);
        let _ = app_tx.send(AppMessage::NetworksChanged {
            wifi_lock_required: initial,
        });

        let app_tx = app_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LINK_SCAN_INTERVAL).await;
                let networks = tokio::task::spawn_blocking(links::scan_wifi_lock_required)
                    .await
                    .unwrap_or_default();
                if app_tx
                    .send(AppMessage::NetworksChanged {
                        wifi_lock_required: networks,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Signal handler for graceful shutdown
    // -----------------------------------------------------------------------
    {
        let app_tx = app_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received Ctrl+C, initiating shutdown");
                    let _ = app_tx.send(AppMessage::Shutdown);
                }
                Err(e) => {
                    error!(error = %e, "failed to listen for Ctrl+C");
                }
            }
        });
    }

    // Everything is wired; open for business.
    let _ = app_tx.send(AppMessage::Enable);

    info!(socket = %socket_path.display(), "daemon is running. Press Ctrl+C to stop.");
    service.run(app_rx).await;

    info!("daemon stopped");

    // Force exit to avoid hanging on lingering background threads from
    // external libraries (the mdns-sd engine thread and its browse pumps)
    // that don't shut down promptly. All graceful cleanup has already
    // completed above.
    std::process::exit(0);
}

/// Initializes the tracing logging infrastructure.
///
/// Sets up a layered subscriber that writes to:
/// 1. stderr — so logs appear in the terminal when running interactively
/// 2. A log file at `~/.local/share/nsdd/daemon.log` — persists across runs
///
/// The log level is controlled by the `NSDD_LOG` environment variable.
/// Defaults to `info` if not set.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_env("NSDD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    // File logging is best-effort; the daemon still works with stderr only.
    let file_layer = DaemonConfig::log_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let log_path = dir.join("daemon.log");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .ok()
        })
        .map(|file| {
            fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
