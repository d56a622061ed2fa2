//! vpncli - VPN Manager CLI Tool
//!
//! Operator commands on top of the vpnmgr library: export client
//! configurations for remote sites, inspect tunnel status, validate the
//! airports configuration and generate fresh key material.

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use libvpnmgr::config::{self, ConfigStore, ResolvedConnection, VpnProtocol};
use libvpnmgr::error::{VpnError, VpnResult};
use libvpnmgr::persist;
use libvpnmgr::settings::Settings;
use libvpnmgr::status::StatusSnapshot;
use libvpnmgr::vpn::{self, common, wireguard, WgKeySet};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "vpncli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "VPN Manager CLI - operator tools for airport site tunnels", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the client configuration a remote site imports
    Export {
        /// Airport identifier (e.g. kbfi)
        airport_id: String,

        /// Write to a file (mode 0600) instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show tunnel status from the daemon's snapshot
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Validate the airports configuration without changing anything
    Check,

    /// Generate fresh key material for a protocol
    Genkey {
        /// VPN protocol (ipsec, wireguard, openvpn)
        #[arg(long)]
        protocol: VpnProtocol,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load_layered(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let result = match &cli.command {
        Commands::Export { airport_id, output } => {
            handle_export(&settings, airport_id, output.as_deref()).await
        }
        Commands::Status { json } => handle_status(&settings, *json).await,
        Commands::Check => handle_check(&settings).await,
        Commands::Genkey { protocol, json } => handle_genkey(*protocol, *json).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn handle_export(
    settings: &Settings,
    airport_id: &str,
    output: Option<&Path>,
) -> VpnResult<()> {
    let store = ConfigStore::new(settings.paths.config_path.clone());
    let file = store.load().await?;

    if !file.airports.contains_key(airport_id) {
        return Err(VpnError::NotFound(format!(
            "airport '{}' not found in {}",
            airport_id,
            store.path().display()
        )));
    }
    let record = file.vpn_record(airport_id).ok_or_else(|| {
        VpnError::NotFound(format!("airport '{}' has no VPN record", airport_id))
    })?;
    if !record.enabled {
        return Err(VpnError::ConfigError(format!(
            "VPN is disabled for airport '{}'",
            airport_id
        )));
    }

    let conn = ResolvedConnection::from_record(airport_id, record)?;

    // The client config embeds the address remote peers dial.
    let server_addr = settings.resolve_server_addr().await?;
    let handlers = vpn::build_handlers(settings, &server_addr);
    let handler = handlers.get(&conn.protocol).ok_or_else(|| {
        VpnError::NotSupported(format!("no handler for protocol '{}'", conn.protocol))
    })?;

    let content = handler.generate_client_config(&conn).map_err(|e| match e {
        VpnError::MissingCredential(msg) => VpnError::MissingCredential(format!(
            "{} (run 'vpnmgrd --once' to back-fill secrets)",
            msg
        )),
        other => other,
    })?;

    match output {
        Some(path) => {
            persist::write_atomic(path, &content, persist::MODE_SECRET).await?;
            println!(
                "Client configuration for '{}' ({}) written to {}",
                airport_id,
                conn.protocol,
                path.display()
            );
        }
        None => print!("{}", content),
    }

    Ok(())
}

async fn handle_status(settings: &Settings, json: bool) -> VpnResult<()> {
    let path = &settings.paths.status_path;
    let content = tokio::fs::read_to_string(path).await.map_err(|_| {
        VpnError::NotFound(format!(
            "no status snapshot at {} (is vpnmgrd running?)",
            path.display()
        ))
    })?;

    if json {
        println!("{}", content.trim_end());
        return Ok(());
    }

    let snapshot: StatusSnapshot = serde_json::from_str(&content)?;

    let when = Utc
        .timestamp_opt(snapshot.timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| snapshot.timestamp.to_string());
    println!("VPN status as of {}", when);

    if snapshot.connections.is_empty() {
        println!("No VPN connections configured");
        return Ok(());
    }

    println!();
    println!(
        "{:<20} {:<10} {:<11} {:<11} {:<8} {}",
        "CONNECTION", "AIRPORT", "PROTOCOL", "STATUS", "HEALTH", "UPTIME"
    );
    for (name, report) in &snapshot.connections {
        println!(
            "{:<20} {:<10} {:<11} {:<11} {:<8} {}",
            name,
            report.airport_id,
            report.protocol,
            report.status,
            report.health_check,
            format_uptime(report.uptime_seconds)
        );
    }

    Ok(())
}

async fn handle_check(settings: &Settings) -> VpnResult<()> {
    let store = ConfigStore::new(settings.paths.config_path.clone());
    let file = store.load().await?;
    let findings = config::validate_file(&file);

    let mut errors = 0;
    let mut warnings = 0;
    for (airport_id, site) in &findings {
        if site.errors.is_empty() && site.warnings.is_empty() {
            continue;
        }
        println!("{}:", airport_id);
        for error in &site.errors {
            println!("  error: {}", error);
            errors += 1;
        }
        for warning in &site.warnings {
            println!("  warning: {}", warning);
            warnings += 1;
        }
    }

    if errors > 0 {
        return Err(VpnError::ConfigError(format!(
            "{} error(s) in {}",
            errors,
            store.path().display()
        )));
    }

    println!(
        "Configuration OK: {} enabled site(s), {} warning(s)",
        file.enabled_site_ids().len(),
        warnings
    );
    Ok(())
}

async fn handle_genkey(protocol: VpnProtocol, json: bool) -> VpnResult<()> {
    match protocol {
        VpnProtocol::Wireguard => {
            // Public keys come from the wg tool; without it this fails
            // rather than emitting keys that would never match.
            let (server_private_key, server_public_key) = wireguard::generate_keypair().await?;
            let (client_private_key, client_public_key) = wireguard::generate_keypair().await?;
            let keys = WgKeySet {
                server_private_key,
                server_public_key,
                client_private_key,
                client_public_key,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else {
                println!("server_private_key: {}", keys.server_private_key);
                println!("server_public_key:  {}", keys.server_public_key);
                println!("client_private_key: {}", keys.client_private_key);
                println!("client_public_key:  {}", keys.client_public_key);
            }
        }
        VpnProtocol::Ipsec | VpnProtocol::Openvpn => {
            let psk = common::generate_psk();
            if json {
                println!("{}", serde_json::json!({ "psk": psk }));
            } else {
                println!("{}", psk);
            }
        }
    }
    Ok(())
}

fn format_uptime(seconds: i64) -> String {
    if seconds <= 0 {
        return "-".to_string();
    }
    if seconds < 60 {
        return format!("{}s", seconds);
    }
    if seconds < 3600 {
        return format!("{}m {:02}s", seconds / 60, seconds % 60);
    }
    format!("{}h {:02}m", seconds / 3600, (seconds % 3600) / 60)
}
