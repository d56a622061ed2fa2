use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::config::{ResolvedConnection, VpnProtocol, VpnRecord};
use crate::error::VpnResult;

/// Control-plane liveness of one tunnel, as reported by its daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Up,
    Down,
    Connecting,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Up => f.write_str("up"),
            TunnelState::Down => f.write_str("down"),
            TunnelState::Connecting => f.write_str("connecting"),
        }
    }
}

/// Classified daemon state plus whatever detail the query produced.
/// Status checks never fail; a failed query is `Down` with the failure
/// text in `detail`.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: TunnelState,
    pub detail: String,
}

impl ConnectionStatus {
    pub fn up(detail: impl Into<String>) -> Self {
        Self { state: TunnelState::Up, detail: detail.into() }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self { state: TunnelState::Down, detail: detail.into() }
    }

    pub fn connecting(detail: impl Into<String>) -> Self {
        Self { state: TunnelState::Connecting, detail: detail.into() }
    }
}

/// One file a handler wants on disk: final path, full content, and the
/// permission mode the content demands.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub content: String,
    pub mode: u32,
}

/// Freshly generated secret material, shaped per protocol.
#[derive(Debug, Clone)]
pub enum SecretMaterial {
    /// Hex pre-shared key (IPsec, OpenVPN)
    Psk(String),
    /// Complete WireGuard key set for one site
    WireguardKeys(WgKeySet),
}

/// The four base64 keys a WireGuard site record carries.
#[derive(Debug, Clone, Serialize)]
pub struct WgKeySet {
    pub server_private_key: String,
    pub server_public_key: String,
    pub client_private_key: String,
    pub client_public_key: String,
}

/// Protocol-group scratch state for secret back-fill: material that is
/// shared across every site of one protocol. Seeded from existing records
/// before any generation, so a populated deployment never regenerates.
#[derive(Debug, Clone, Default)]
pub struct SharedSecrets {
    /// WireGuard server (private, public) pair; one wg0 interface serves
    /// all sites.
    pub server_keypair: Option<(String, String)>,
    /// OpenVPN static key; PSK mode shares one across all sites.
    pub shared_psk: Option<String>,
}

/// Common interface implemented by each tunnel protocol.
///
/// Handlers never talk to the network themselves; they generate the
/// artifacts the external daemons consume and query those daemons as
/// opaque oracles (status, key derivation, reachability). Every oracle
/// call is time-bounded and failure degrades, never propagates.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Which protocol this handler owns.
    fn protocol(&self) -> VpnProtocol;

    /// Check if the external tooling for this protocol is installed.
    async fn is_available(&self) -> bool;

    /// Primary server configuration text for the given connections.
    /// Pure; must return a complete, valid minimal config for an empty set.
    fn generate_server_config(&self, connections: &[&ResolvedConnection]) -> VpnResult<String>;

    /// Every server-side file for the given connections, secrets included.
    fn server_artifacts(&self, connections: &[&ResolvedConnection]) -> VpnResult<Vec<Artifact>>;

    /// The artifact a remote peer imports. Fails with `MissingCredential`
    /// when required secret material is absent from the record.
    fn generate_client_config(&self, connection: &ResolvedConnection) -> VpnResult<String>;

    /// Generate a full set of fresh secret material for one site.
    async fn generate_secret_material(&self) -> VpnResult<SecretMaterial>;

    /// Fill whatever secret material `record` lacks, drawing shared values
    /// from `shared` (and storing newly generated shared values back into
    /// it). Returns true when anything was generated. Idempotent: a fully
    /// populated record is left untouched.
    async fn ensure_secret_material(
        &self,
        record: &mut VpnRecord,
        shared: &mut SharedSecrets,
    ) -> VpnResult<bool>;

    /// Classify the daemon's live state for one connection.
    async fn check_connection_status(&self, connection_name: &str) -> ConnectionStatus;

    /// Active reachability probe toward the remote subnet's gateway.
    /// True means traffic flows; any probe error is unhealthy.
    async fn health_check(&self, connection_name: &str, remote_subnet: Ipv4Net) -> bool;
}

/// Handler registry keyed by protocol tag.
pub type HandlerRegistry = BTreeMap<VpnProtocol, Box<dyn ProtocolHandler>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TunnelState::Up).unwrap(), "\"up\"");
        assert_eq!(serde_json::to_string(&TunnelState::Down).unwrap(), "\"down\"");
        assert_eq!(
            serde_json::to_string(&TunnelState::Connecting).unwrap(),
            "\"connecting\""
        );
    }

    #[test]
    fn test_status_constructors() {
        let status = ConnectionStatus::down("daemon unreachable");
        assert_eq!(status.state, TunnelState::Down);
        assert_eq!(status.detail, "daemon unreachable");
        assert_eq!(ConnectionStatus::up("x").state, TunnelState::Up);
        assert_eq!(ConnectionStatus::connecting("x").state, TunnelState::Connecting);
    }
}
