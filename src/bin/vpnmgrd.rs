//! VPN Manager Daemon (vpnmgrd)
//!
//! Periodically reconciles the declarative airports configuration with
//! the tunnel daemons on this host: back-fills secrets and client
//! addresses, rewrites IPsec/WireGuard/OpenVPN configuration, and
//! publishes a status snapshot for the dashboard.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root for /etc writes)
//! sudo vpnmgrd
//!
//! # Start with verbose logging
//! sudo vpnmgrd --verbose
//!
//! # Run a single reconciliation cycle and exit
//! sudo vpnmgrd --once
//! ```

use clap::Parser;
use libvpnmgr::error::VpnResult;
use libvpnmgr::monitor::VpnManager;
use libvpnmgr::settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// VPN Manager Daemon
#[derive(Parser, Debug)]
#[command(name = "vpnmgrd")]
#[command(author = "AviationWX Team")]
#[command(version)]
#[command(about = "VPN Manager Daemon - maintains site-to-site tunnels for airport stations", long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run one reconciliation cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> VpnResult<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting VPN Manager Daemon (vpnmgrd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Check if running as root
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("⚠️  Not running as root - writes to /etc may fail");
            warn!("   Consider running with sudo for full functionality");
        }
    }

    let settings = match Settings::load_layered(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("✗ Failed to load settings: {}", e);
            return Err(e);
        }
    };
    info!("Airports config: {}", settings.paths.config_path.display());
    info!("Status file: {}", settings.paths.status_path.display());

    let server_addr = match settings.resolve_server_addr().await {
        Ok(addr) => addr,
        Err(e) => {
            error!("✗ Cannot determine the VPN server address: {}", e);
            error!("  Set network.server_addr or network.domain in the settings file,");
            error!("  or export VPN_SERVER_IP / DOMAIN");
            return Err(e);
        }
    };
    info!("VPN server address: {}", server_addr);

    let mut manager = VpnManager::new(settings, &server_addr);

    if args.once {
        manager.run_cycle().await;
        info!("Single cycle complete");
        return Ok(());
    }

    // Setup signal handlers
    let running = manager.running_flag();
    let wake = manager.waker();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(running, wake).await {
            error!("Signal handler error: {}", e);
        }
    });

    manager.run().await
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "vpnmgr={},vpnmgrd={},libvpnmgr={}",
            log_level, log_level, log_level
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals (SIGTERM, SIGINT, SIGHUP)
async fn handle_signals(running: Arc<RwLock<bool>>, wake: Arc<Notify>) -> VpnResult<()> {
    #[cfg(unix)]
    {
        use libvpnmgr::error::VpnError;
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            VpnError::ServiceError(format!("Failed to register SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            VpnError::ServiceError(format!("Failed to register SIGINT handler: {}", e))
        })?;
        let mut sighup = signal(SignalKind::hangup()).map_err(|e| {
            VpnError::ServiceError(format!("Failed to register SIGHUP handler: {}", e))
        })?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    *running.write().await = false;
                    wake.notify_waiters();
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    *running.write().await = false;
                    wake.notify_waiters();
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, scheduling an immediate cycle");
                    wake.notify_waiters();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        use libvpnmgr::error::VpnError;
        use tokio::signal;

        // On non-Unix platforms, just wait for Ctrl+C
        signal::ctrl_c()
            .await
            .map_err(|e| VpnError::ServiceError(format!("Failed to listen for Ctrl+C: {}", e)))?;
        info!("Received Ctrl+C, initiating graceful shutdown");
        *running.write().await = false;
        wake.notify_waiters();
    }

    Ok(())
}
