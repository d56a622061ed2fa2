//! Airports configuration store
//!
//! The declarative source of truth is an operator-owned JSON document
//! mapping airport ids to site records; the `vpn` object inside each record
//! is the part this daemon consumes. The store is read-only here except for
//! the idempotent back-fill of generated secrets, keys, and client
//! addresses. Every struct carries a flattened map of unknown fields so a
//! back-fill rewrite never drops operator content.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::{VpnError, VpnResult};
use crate::persist;

/// Tunnel protocol selector for a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    Ipsec,
    Wireguard,
    Openvpn,
}

impl VpnProtocol {
    pub const ALL: [VpnProtocol; 3] =
        [VpnProtocol::Ipsec, VpnProtocol::Wireguard, VpnProtocol::Openvpn];

    pub fn as_str(&self) -> &'static str {
        match self {
            VpnProtocol::Ipsec => "ipsec",
            VpnProtocol::Wireguard => "wireguard",
            VpnProtocol::Openvpn => "openvpn",
        }
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VpnProtocol {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipsec" => Ok(VpnProtocol::Ipsec),
            "wireguard" => Ok(VpnProtocol::Wireguard),
            "openvpn" => Ok(VpnProtocol::Openvpn),
            other => Err(VpnError::NotSupported(format!("VPN type '{}'", other))),
        }
    }
}

/// Whole airports document. Everything outside `airports` is opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AirportsFile {
    #[serde(default)]
    pub airports: BTreeMap<String, AirportEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One airport record. Only the vpn object matters to this daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AirportEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn: Option<VpnRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Site VPN record as the operator writes it.
///
/// All protocol parameters stay optional here; defaults are applied when the
/// record is resolved for a cycle, so a rewrite only ever adds the fields
/// this daemon generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnRecord {
    #[serde(default)]
    pub enabled: bool,
    /// Protocol selector; absent means ipsec. Kept as a raw string so one
    /// bad record cannot fail deserialization of the whole document.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub vpn_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_subnet: Option<String>,
    /// IPsec pre-shared key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_stringly"
    )]
    pub ike_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_stringly"
    )]
    pub dh_group: Option<String>,
    /// Assigned client endpoint, `a.b.c.d/32`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard: Option<WireGuardKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openvpn: Option<OpenVpnSecrets>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// WireGuard key material for one site. The server pair is shared by every
/// site (the server has a single wg0 interface).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireGuardKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_public_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WireGuardKeys {
    pub fn is_complete(&self) -> bool {
        [
            &self.server_private_key,
            &self.server_public_key,
            &self.client_private_key,
            &self.client_public_key,
        ]
        .iter()
        .all(|k| k.as_deref().map(|s| !s.is_empty()).unwrap_or(false))
    }

    pub fn server_pair(&self) -> Option<(String, String)> {
        match (&self.server_private_key, &self.server_public_key) {
            (Some(private), Some(public)) if !private.is_empty() && !public.is_empty() => {
                Some((private.clone(), public.clone()))
            }
            _ => None,
        }
    }
}

/// OpenVPN secret material; one PSK shared across all sites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenVpnSecrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VpnRecord {
    /// Connection name, defaulting to `<airport-id>_vpn`.
    pub fn connection_name_for(&self, airport_id: &str) -> String {
        match &self.connection_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}_vpn", airport_id),
        }
    }

    pub fn protocol(&self) -> VpnResult<VpnProtocol> {
        match &self.vpn_type {
            Some(t) => t.parse(),
            None => Ok(VpnProtocol::Ipsec),
        }
    }

    /// Parsed client endpoint; bare addresses are treated as /32.
    pub fn client_endpoint(&self) -> Option<Ipv4Net> {
        let raw = self.client_ip.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.contains('/') {
            raw.parse().ok()
        } else {
            raw.parse::<Ipv4Addr>()
                .ok()
                .and_then(|addr| Ipv4Net::new(addr, 32).ok())
        }
    }
}

/// Operator JSON sometimes carries numerics as numbers, sometimes as
/// strings. Accept both.
fn de_opt_stringly<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(de)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Per-cycle expansion of a Site VPN Record with defaults applied.
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub airport_id: String,
    pub connection_name: String,
    pub protocol: VpnProtocol,
    pub remote_subnet: Ipv4Net,
    pub client_ip: Option<Ipv4Net>,
    pub psk: Option<String>,
    pub ike_version: String,
    pub encryption: String,
    pub dh_group: String,
    pub wireguard: WireGuardKeys,
    pub openvpn_psk: Option<String>,
}

impl ResolvedConnection {
    pub fn from_record(airport_id: &str, record: &VpnRecord) -> VpnResult<Self> {
        let protocol = record.protocol()?;

        let remote_raw = record
            .remote_subnet
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                VpnError::ConfigError(format!("{}: missing remote_subnet", airport_id))
            })?;
        let remote_subnet: Ipv4Net = remote_raw.parse().map_err(|e| {
            VpnError::ConfigError(format!(
                "{}: invalid remote_subnet '{}': {}",
                airport_id, remote_raw, e
            ))
        })?;

        Ok(Self {
            airport_id: airport_id.to_string(),
            connection_name: record.connection_name_for(airport_id),
            protocol,
            remote_subnet,
            client_ip: record.client_endpoint(),
            psk: record.psk.clone().filter(|s| !s.is_empty()),
            ike_version: record.ike_version.clone().unwrap_or_else(|| "2".to_string()),
            encryption: record
                .encryption
                .clone()
                .unwrap_or_else(|| "aes256gcm128".to_string()),
            dh_group: record.dh_group.clone().unwrap_or_else(|| "14".to_string()),
            wireguard: record.wireguard.clone().unwrap_or_default(),
            openvpn_psk: record
                .openvpn
                .as_ref()
                .and_then(|o| o.psk.clone())
                .filter(|s| !s.is_empty()),
        })
    }
}

impl AirportsFile {
    /// Airport ids whose vpn record is enabled, in document order.
    pub fn enabled_site_ids(&self) -> Vec<String> {
        self.airports
            .iter()
            .filter(|(_, airport)| airport.vpn.as_ref().map(|v| v.enabled).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn vpn_record(&self, airport_id: &str) -> Option<&VpnRecord> {
        self.airports.get(airport_id).and_then(|a| a.vpn.as_ref())
    }

    pub fn vpn_record_mut(&mut self, airport_id: &str) -> Option<&mut VpnRecord> {
        self.airports.get_mut(airport_id).and_then(|a| a.vpn.as_mut())
    }

    /// Expand every enabled record into a Resolved Connection, keyed by
    /// connection name. Records that fail to resolve are skipped with an
    /// error log; a duplicate connection name is an operator error and the
    /// later record wins.
    pub fn resolve_connections(&self) -> BTreeMap<String, ResolvedConnection> {
        let mut connections = BTreeMap::new();

        for id in self.enabled_site_ids() {
            let record = match self.vpn_record(&id) {
                Some(record) => record,
                None => continue,
            };
            match ResolvedConnection::from_record(&id, record) {
                Ok(resolved) => {
                    let name = resolved.connection_name.clone();
                    if let Some(previous) =
                        connections.insert(name.clone(), resolved)
                    {
                        error!(
                            "Duplicate connection name '{}' ({} and {}); keeping {}",
                            name,
                            previous.airport_id,
                            connections[&name].airport_id,
                            connections[&name].airport_id
                        );
                    }
                }
                Err(e) => {
                    error!("Skipping VPN for {}: {}", id, e);
                }
            }
        }

        connections
    }

    /// Client addresses already assigned across all enabled records,
    /// regardless of protocol; the subnet is shared.
    pub fn in_use_addresses(&self) -> BTreeSet<Ipv4Addr> {
        let mut in_use = BTreeSet::new();
        for id in self.enabled_site_ids() {
            if let Some(endpoint) =
                self.vpn_record(&id).and_then(|record| record.client_endpoint())
            {
                in_use.insert(endpoint.addr());
            }
        }
        in_use
    }
}

/// Read/back-fill interface to the operator-owned store.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn mtime(&self) -> Option<SystemTime> {
        persist::file_mtime(&self.path).await
    }

    /// Load the document. Missing, unreadable, or malformed input is
    /// `ConfigUnavailable`; the caller retries after a back-off.
    pub async fn load(&self) -> VpnResult<AirportsFile> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            VpnError::ConfigUnavailable(format!("{}: {}", self.path.display(), e))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            VpnError::ConfigUnavailable(format!("{}: {}", self.path.display(), e))
        })
    }

    /// Persist a back-filled document. The store carries PSKs, so the write
    /// is atomic and keeps whatever permission mode the operator gave the
    /// file (0600 when it is new).
    pub async fn save(&self, file: &AirportsFile) -> VpnResult<()> {
        let mode = persist::file_mode(&self.path)
            .await
            .unwrap_or(persist::MODE_SECRET);
        let content = serde_json::to_string_pretty(file)?;
        persist::write_atomic(&self.path, &content, mode).await?;
        debug!("Back-filled {}", self.path.display());
        Ok(())
    }
}

/// Validation findings for one site record, used by the CLI checker.
#[derive(Debug, Clone, Default)]
pub struct SiteFindings {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validate every enabled record without mutating anything.
pub fn validate_file(file: &AirportsFile) -> BTreeMap<String, SiteFindings> {
    let mut findings: BTreeMap<String, SiteFindings> = BTreeMap::new();
    let mut seen_names: BTreeMap<String, String> = BTreeMap::new();

    for id in file.enabled_site_ids() {
        let record = match file.vpn_record(&id) {
            Some(record) => record,
            None => continue,
        };
        let entry = findings.entry(id.clone()).or_default();

        let protocol = match record.protocol() {
            Ok(protocol) => Some(protocol),
            Err(_) => {
                entry.errors.push(format!(
                    "unknown VPN type '{}'",
                    record.vpn_type.as_deref().unwrap_or("")
                ));
                None
            }
        };

        match record.remote_subnet.as_deref().map(str::trim) {
            None | Some("") => entry.errors.push("missing remote_subnet".to_string()),
            Some(raw) => {
                if raw.parse::<Ipv4Net>().is_err() {
                    entry
                        .errors
                        .push(format!("invalid remote_subnet '{}'", raw));
                }
            }
        }

        if let Some(raw) = record.client_ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if record.client_endpoint().is_none() {
                entry.errors.push(format!("invalid client_ip '{}'", raw));
            }
        }

        let name = record.connection_name_for(&id);
        if let Some(other) = seen_names.insert(name.clone(), id.clone()) {
            entry
                .errors
                .push(format!("connection name '{}' also used by {}", name, other));
        }

        match protocol {
            Some(VpnProtocol::Ipsec) => {
                if record.psk.as_deref().map(str::trim).filter(|s| !s.is_empty()).is_none() {
                    entry
                        .warnings
                        .push("no psk configured; one will be generated".to_string());
                }
                if let Some(group) = record.dh_group.as_deref() {
                    if !matches!(group, "14" | "15" | "16" | "17" | "18") {
                        entry.warnings.push(format!(
                            "dh_group '{}' not in the known table; 2048-bit assumed",
                            group
                        ));
                    }
                }
            }
            Some(VpnProtocol::Wireguard) => {
                let complete = record
                    .wireguard
                    .as_ref()
                    .map(|k| k.is_complete())
                    .unwrap_or(false);
                if !complete {
                    entry
                        .warnings
                        .push("wireguard keys incomplete; they will be generated".to_string());
                }
            }
            Some(VpnProtocol::Openvpn) => {
                let has_psk = record
                    .openvpn
                    .as_ref()
                    .and_then(|o| o.psk.as_deref())
                    .map(|s| !s.trim().is_empty())
                    .unwrap_or(false);
                if !has_psk {
                    entry
                        .warnings
                        .push("no openvpn psk configured; one will be generated".to_string());
                }
            }
            None => {}
        }

        if entry.errors.is_empty() && entry.warnings.is_empty() {
            findings.remove(&id);
        }
    }

    for (id, f) in &findings {
        for w in &f.warnings {
            warn!("{}: {}", id, w);
        }
    }

    findings
}
