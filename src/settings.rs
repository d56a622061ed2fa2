//! Daemon settings for vpnmgr
//!
//! Settings come from three layers: compiled defaults, an optional TOML
//! file, and environment overrides (the deployment surface the container
//! images use). Later layers win.

use std::env;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{VpnError, VpnResult};

/// Main vpnmgr settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// File and directory locations
    #[serde(default)]
    pub paths: SettingsPaths,
    /// Reconciliation timing
    #[serde(default)]
    pub timing: TimingSettings,
    /// VPN addressing and identity
    #[serde(default)]
    pub network: NetworkSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsPaths {
    /// Declarative airports configuration (JSON)
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// Published status snapshot
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,
    /// strongSwan artifact directory
    #[serde(default = "default_ipsec_dir")]
    pub ipsec_dir: PathBuf,
    /// WireGuard artifact directory
    #[serde(default = "default_wireguard_dir")]
    pub wireguard_dir: PathBuf,
    /// OpenVPN artifact directory
    #[serde(default = "default_openvpn_dir")]
    pub openvpn_dir: PathBuf,
    /// Per-site client config exports
    #[serde(default = "default_client_config_dir")]
    pub client_config_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Seconds between reconciliation cycles
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// Back-off after a failed cycle
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Minimum seconds between health probes per connection
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Shared VPN subnet for all protocols and sites
    #[serde(default = "default_vpn_subnet")]
    pub vpn_subnet: Ipv4Net,
    /// Explicit server address for client configs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<String>,
    /// Domain resolved when no explicit server address is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// IKE identity presented by the local (server) side
    #[serde(default = "default_local_id")]
    pub local_id: String,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/vpnmgr/airports.json")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("/run/vpnmgr/vpn-status.json")
}

fn default_ipsec_dir() -> PathBuf {
    PathBuf::from("/etc/ipsec-shared")
}

fn default_wireguard_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard-shared")
}

fn default_openvpn_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn-shared")
}

fn default_client_config_dir() -> PathBuf {
    PathBuf::from("/etc/vpnmgr/clients")
}

fn default_update_interval() -> u64 {
    30
}

fn default_error_backoff() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    300
}

fn default_vpn_subnet() -> Ipv4Net {
    // Always parseable; kept as a literal so the default shows up in docs.
    "10.0.0.0/16".parse().unwrap_or_else(|_| unreachable!())
}

fn default_local_id() -> String {
    "@vpn.server".to_string()
}

impl Default for SettingsPaths {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            status_path: default_status_path(),
            ipsec_dir: default_ipsec_dir(),
            wireguard_dir: default_wireguard_dir(),
            openvpn_dir: default_openvpn_dir(),
            client_config_dir: default_client_config_dir(),
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            error_backoff_secs: default_error_backoff(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            vpn_subnet: default_vpn_subnet(),
            server_addr: None,
            domain: None,
            local_id: default_local_id(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: SettingsPaths::default(),
            timing: TimingSettings::default(),
            network: NetworkSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::ConfigError(format!("Failed to read settings: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnError::ConfigError(format!("Failed to parse settings: {}", e)))
    }

    /// Load settings from an optional file, then apply environment
    /// overrides. A missing explicit file is an error; a missing default
    /// file falls back to compiled defaults.
    pub fn load_layered(explicit: Option<&Path>) -> VpnResult<Self> {
        let mut settings = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let default_file = Path::new("/etc/vpnmgr/vpnmgr.toml");
                if default_file.exists() {
                    Self::load(default_file)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Apply the environment overrides the deployment images set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var("CONFIG_PATH") {
            if !path.is_empty() {
                self.paths.config_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = env::var("STATUS_FILE") {
            if !path.is_empty() {
                self.paths.status_path = PathBuf::from(path);
            }
        }
        if let Ok(subnet) = env::var("VPN_SUBNET") {
            match subnet.parse::<Ipv4Net>() {
                Ok(net) => self.network.vpn_subnet = net,
                Err(e) => warn!("Ignoring unparseable VPN_SUBNET {:?}: {}", subnet, e),
            }
        }
        if let Ok(addr) = env::var("VPN_SERVER_IP") {
            if !addr.is_empty() {
                self.network.server_addr = Some(addr);
            }
        }
        if let Ok(domain) = env::var("DOMAIN") {
            if !domain.is_empty() {
                self.network.domain = Some(domain);
            }
        }
    }

    /// Resolve the address clients dial.
    ///
    /// An explicit `server_addr` wins; otherwise the configured domain is
    /// resolved over DNS. Without either, the orchestrator cannot emit
    /// client configs and refuses to start.
    pub async fn resolve_server_addr(&self) -> VpnResult<String> {
        if let Some(addr) = &self.network.server_addr {
            if !addr.is_empty() {
                info!("Using configured server address: {}", addr);
                return Ok(addr.clone());
            }
        }

        if let Some(domain) = &self.network.domain {
            let mut addrs = tokio::net::lookup_host((domain.as_str(), 0))
                .await
                .map_err(|e| {
                    VpnError::ConfigUnavailable(format!("Failed to resolve {}: {}", domain, e))
                })?;
            if let Some(found) = addrs.find(|a| a.is_ipv4()) {
                let ip = found.ip().to_string();
                info!("Resolved {} to {}", domain, ip);
                return Ok(ip);
            }
            return Err(VpnError::ConfigUnavailable(format!(
                "No IPv4 address for {}",
                domain
            )));
        }

        Err(VpnError::ConfigUnavailable(
            "VPN server address not configured. Set VPN_SERVER_IP or DOMAIN.".to_string(),
        ))
    }
}
