use std::path::PathBuf;

use async_trait::async_trait;
use base64::prelude::*;
use ipnet::Ipv4Net;
use tracing::warn;

use crate::allocator;
use crate::config::{ResolvedConnection, VpnProtocol, VpnRecord};
use crate::error::{VpnError, VpnResult};
use crate::persist;

use super::common;
use super::handler::{
    Artifact, ConnectionStatus, ProtocolHandler, SecretMaterial, SharedSecrets, WgKeySet,
};

/// Default WireGuard listen port
pub const WG_PORT: u16 = 51820;

/// WireGuard handler.
///
/// The server runs a single wg0 interface with one peer per site, so all
/// site records share one server key pair while each site carries its own
/// client pair. Key derivation leans on the wg tool; Curve25519 is not
/// reimplemented here.
pub struct WireguardHandler {
    server_addr: String,
    vpn_subnet: Ipv4Net,
    config_dir: PathBuf,
}

/// Derive the base64 public key for a private key by piping it to
/// `wg pubkey`. Any tool failure is `DerivationUnavailable`.
pub async fn derive_public_key(private_key: &str) -> VpnResult<String> {
    let input = format!("{}\n", private_key);
    let output = common::run_command_with_stdin("wg", &["pubkey"], &input)
        .await
        .map_err(|e| VpnError::DerivationUnavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(VpnError::DerivationUnavailable(
            "wg pubkey rejected the private key".to_string(),
        ));
    }

    let public_key = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if public_key.is_empty() {
        return Err(VpnError::DerivationUnavailable(
            "wg pubkey produced no output".to_string(),
        ));
    }
    Ok(public_key)
}

/// Generate a key pair: 32 random bytes as the base64 private key, public
/// half derived by the wg tool.
pub async fn generate_keypair() -> VpnResult<(String, String)> {
    let bytes: [u8; 32] = rand::random();
    let private_key = BASE64_STANDARD.encode(bytes);
    let public_key = derive_public_key(&private_key).await?;
    Ok((private_key, public_key))
}

impl WireguardHandler {
    pub fn new(server_addr: String, vpn_subnet: Ipv4Net, config_dir: PathBuf) -> Self {
        Self { server_addr, vpn_subnet, config_dir }
    }

    /// Complete one half-filled key pair: derive the public half when the
    /// private half exists, otherwise generate a fresh pair.
    async fn complete_pair(
        private: &Option<String>,
        public: &Option<String>,
    ) -> VpnResult<Option<(String, String)>> {
        let private = private.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let public = public.as_deref().map(str::trim).filter(|s| !s.is_empty());

        match (private, public) {
            (Some(_), Some(_)) => Ok(None),
            (Some(private), None) => {
                let public = derive_public_key(private).await?;
                Ok(Some((private.to_string(), public)))
            }
            _ => Ok(Some(generate_keypair().await?)),
        }
    }
}

#[async_trait]
impl ProtocolHandler for WireguardHandler {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::Wireguard
    }

    async fn is_available(&self) -> bool {
        common::check_binary_available("wg").await
    }

    fn generate_server_config(&self, connections: &[&ResolvedConnection]) -> VpnResult<String> {
        let mut conf = String::new();
        conf.push_str("# WireGuard server configuration\n");
        conf.push_str("# Auto-generated from airports.json\n");
        conf.push_str("\n");
        conf.push_str("[Interface]\n");
        conf.push_str("# Server IP in VPN subnet\n");
        conf.push_str(&format!(
            "Address = {}/32\n",
            allocator::server_address(self.vpn_subnet)
        ));
        conf.push_str(&format!("ListenPort = {}\n", WG_PORT));

        if !connections.is_empty() {
            // All records share one server pair; take the first populated one.
            let server_private_key = connections
                .iter()
                .find_map(|c| c.wireguard.server_private_key.as_deref())
                .filter(|k| !k.is_empty());

            match server_private_key {
                Some(key) => {
                    conf.push_str("\n");
                    conf.push_str(&format!("PrivateKey = {}\n", key));
                }
                None => warn!("Server private key not found in config"),
            }
        }

        for conn in connections {
            let client_public_key = conn
                .wireguard
                .client_public_key
                .as_deref()
                .filter(|k| !k.is_empty());
            let client_public_key = match client_public_key {
                Some(key) => key,
                None => {
                    warn!("Client public key not found for {}", conn.connection_name);
                    continue;
                }
            };

            conf.push_str("\n");
            conf.push_str(&format!(
                "# Peer: {} ({})\n",
                conn.airport_id, conn.connection_name
            ));
            conf.push_str("[Peer]\n");
            conf.push_str(&format!("PublicKey = {}\n", client_public_key));
            if let Some(client_ip) = conn.client_ip {
                conf.push_str(&format!("AllowedIPs = {}\n", client_ip));
            }
            conf.push_str(&format!("# Remote subnet: {}\n", conn.remote_subnet));
        }

        Ok(conf)
    }

    fn server_artifacts(&self, connections: &[&ResolvedConnection]) -> VpnResult<Vec<Artifact>> {
        Ok(vec![Artifact {
            path: self.config_dir.join("wg0.conf"),
            content: self.generate_server_config(connections)?,
            mode: persist::MODE_SECRET,
        }])
    }

    fn generate_client_config(&self, connection: &ResolvedConnection) -> VpnResult<String> {
        let client_private_key = connection
            .wireguard
            .client_private_key
            .as_deref()
            .filter(|k| !k.is_empty());
        let server_public_key = connection
            .wireguard
            .server_public_key
            .as_deref()
            .filter(|k| !k.is_empty());

        let (client_private_key, server_public_key) = match (client_private_key, server_public_key)
        {
            (Some(private), Some(public)) => (private, public),
            _ => {
                return Err(VpnError::MissingCredential(format!(
                    "WireGuard keys for {}",
                    connection.connection_name
                )))
            }
        };

        let mut conf = String::new();
        conf.push_str(&format!(
            "# WireGuard client configuration for {}\n",
            connection.airport_id
        ));
        conf.push_str(&format!("# Connection: {}\n", connection.connection_name));
        conf.push_str("\n");
        conf.push_str("[Interface]\n");
        conf.push_str(&format!("PrivateKey = {}\n", client_private_key));
        if let Some(client_ip) = connection.client_ip {
            conf.push_str(&format!("Address = {}\n", client_ip));
        }
        conf.push_str("\n");
        conf.push_str("[Peer]\n");
        conf.push_str(&format!("PublicKey = {}\n", server_public_key));
        conf.push_str(&format!("Endpoint = {}:{}\n", self.server_addr, WG_PORT));
        conf.push_str(&format!("AllowedIPs = {}\n", connection.remote_subnet));
        conf.push_str("PersistentKeepalive = 25\n");

        Ok(conf)
    }

    async fn generate_secret_material(&self) -> VpnResult<SecretMaterial> {
        let (server_private_key, server_public_key) = generate_keypair().await?;
        let (client_private_key, client_public_key) = generate_keypair().await?;
        Ok(SecretMaterial::WireguardKeys(WgKeySet {
            server_private_key,
            server_public_key,
            client_private_key,
            client_public_key,
        }))
    }

    async fn ensure_secret_material(
        &self,
        record: &mut VpnRecord,
        shared: &mut SharedSecrets,
    ) -> VpnResult<bool> {
        let keys = record.wireguard.get_or_insert_with(Default::default);
        let mut changed = false;

        // One server pair serves every site. Populate the shared slot first,
        // preferring whatever this record already carries.
        if shared.server_keypair.is_none() {
            shared.server_keypair = match Self::complete_pair(
                &keys.server_private_key,
                &keys.server_public_key,
            )
            .await?
            {
                Some(pair) => Some(pair),
                None => keys.server_pair(),
            };
        }

        if keys.server_pair().is_none() {
            let (private, public) = shared
                .server_keypair
                .clone()
                .ok_or_else(|| VpnError::MissingCredential("server key pair".to_string()))?;
            keys.server_private_key = Some(private);
            keys.server_public_key = Some(public);
            changed = true;
        }

        if let Some((private, public)) =
            Self::complete_pair(&keys.client_private_key, &keys.client_public_key).await?
        {
            keys.client_private_key = Some(private);
            keys.client_public_key = Some(public);
            changed = true;
        }

        Ok(changed)
    }

    async fn check_connection_status(&self, _connection_name: &str) -> ConnectionStatus {
        // WireGuard has no per-connection daemon state; peers live on wg0.
        let output = match common::run_command("wg", &["show", "wg0"]).await {
            Ok(output) => output,
            Err(e) => return ConnectionStatus::down(e.to_string()),
        };

        if !output.status.success() {
            return ConnectionStatus::down("WireGuard interface wg0 not found");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.to_lowercase().contains("latest handshake") {
            ConnectionStatus::up(stdout.trim().to_string())
        } else {
            ConnectionStatus::down("No active peers")
        }
    }

    async fn health_check(&self, _connection_name: &str, remote_subnet: Ipv4Net) -> bool {
        // No interface, no tunnel; skip the ping in that case.
        match common::run_command("ip", &["link", "show", "wg0"]).await {
            Ok(output) if output.status.success() => {}
            _ => return false,
        }

        common::probe_gateway(remote_subnet).await
    }
}
