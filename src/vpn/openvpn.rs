use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::warn;

use crate::config::{ResolvedConnection, VpnProtocol, VpnRecord};
use crate::error::{VpnError, VpnResult};
use crate::persist;

use super::common;
use super::handler::{
    Artifact, ConnectionStatus, ProtocolHandler, SecretMaterial, SharedSecrets,
};

/// Default OpenVPN port
pub const OPENVPN_PORT: u16 = 1194;

/// OpenVPN handler running the server in static-key (PSK) mode.
///
/// One UDP server instance carries every site; authentication is a single
/// shared static key, and per-site routing is expressed as route lines in
/// the server config.
pub struct OpenvpnHandler {
    server_addr: String,
    vpn_subnet: Ipv4Net,
    config_dir: PathBuf,
}

impl OpenvpnHandler {
    pub fn new(server_addr: String, vpn_subnet: Ipv4Net, config_dir: PathBuf) -> Self {
        Self { server_addr, vpn_subnet, config_dir }
    }

    fn psk_path(&self) -> PathBuf {
        self.config_dir.join("psk.key")
    }

    /// The shared static key: the first record that carries one. A missing
    /// key is generated on the spot so the artifact is never empty; the
    /// back-fill normally fills the records long before this runs.
    fn build_psk_file(&self, connections: &[&ResolvedConnection]) -> String {
        if connections.is_empty() {
            return String::new();
        }

        match connections.iter().find_map(|c| c.openvpn_psk.as_deref()) {
            Some(psk) => format!("{}\n", psk),
            None => {
                warn!("PSK not found, generating new one");
                format!("{}\n", common::generate_psk())
            }
        }
    }

    fn base_server_config(&self) -> String {
        let mut conf = String::new();
        conf.push_str("# OpenVPN server configuration (no clients configured)\n");
        conf.push_str(&format!("port {}\n", OPENVPN_PORT));
        conf.push_str("proto udp\n");
        conf.push_str("dev tun\n");
        conf.push_str(&format!(
            "server {} {}\n",
            self.vpn_subnet.network(),
            self.vpn_subnet.netmask()
        ));
        conf.push_str("keepalive 10 120\n");
        conf.push_str("comp-lzo\n");
        conf.push_str("verb 3\n");
        conf.push_str("cipher AES-256-CBC\n");
        conf.push_str("auth SHA256\n");
        conf.push_str("persist-key\n");
        conf.push_str("persist-tun\n");
        conf
    }
}

#[async_trait]
impl ProtocolHandler for OpenvpnHandler {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::Openvpn
    }

    async fn is_available(&self) -> bool {
        common::check_binary_available("openvpn").await
    }

    fn generate_server_config(&self, connections: &[&ResolvedConnection]) -> VpnResult<String> {
        if connections.is_empty() {
            return Ok(self.base_server_config());
        }

        let mut conf = String::new();
        conf.push_str("# OpenVPN server configuration\n");
        conf.push_str("# Auto-generated from airports.json\n");
        conf.push_str("\n");
        conf.push_str(&format!("port {}\n", OPENVPN_PORT));
        conf.push_str("proto udp\n");
        conf.push_str("dev tun\n");
        conf.push_str("\n");
        conf.push_str("# Server IP in VPN subnet\n");
        conf.push_str(&format!(
            "server {} {}\n",
            self.vpn_subnet.network(),
            self.vpn_subnet.netmask()
        ));
        conf.push_str("\n");
        conf.push_str("# PSK for authentication\n");
        conf.push_str(&format!("secret {}\n", self.psk_path().display()));
        conf.push_str("\n");
        conf.push_str("# Keepalive\n");
        conf.push_str("keepalive 10 120\n");
        conf.push_str("\n");
        conf.push_str("# Compression\n");
        conf.push_str("comp-lzo\n");
        conf.push_str("\n");
        conf.push_str("# Logging\n");
        conf.push_str("verb 3\n");
        conf.push_str("\n");
        conf.push_str("# Security\n");
        conf.push_str("cipher AES-256-CBC\n");
        conf.push_str("auth SHA256\n");
        conf.push_str("\n");
        conf.push_str("# Persistence\n");
        conf.push_str("persist-key\n");
        conf.push_str("persist-tun\n");

        for conn in connections {
            if let Some(client_ip) = conn.client_ip {
                conf.push_str("\n");
                conf.push_str(&format!(
                    "# Route for {} ({})\n",
                    conn.airport_id, conn.connection_name
                ));
                conf.push_str(&format!(
                    "route {} {}\n",
                    conn.remote_subnet,
                    client_ip.addr()
                ));
            }
        }

        Ok(conf)
    }

    fn server_artifacts(&self, connections: &[&ResolvedConnection]) -> VpnResult<Vec<Artifact>> {
        Ok(vec![
            Artifact {
                path: self.config_dir.join("server.conf"),
                content: self.generate_server_config(connections)?,
                mode: persist::MODE_PUBLIC,
            },
            Artifact {
                path: self.psk_path(),
                content: self.build_psk_file(connections),
                mode: persist::MODE_SECRET,
            },
        ])
    }

    fn generate_client_config(&self, connection: &ResolvedConnection) -> VpnResult<String> {
        let psk = connection.openvpn_psk.as_deref().ok_or_else(|| {
            VpnError::MissingCredential(format!("PSK for {}", connection.connection_name))
        })?;

        let mut conf = String::new();
        conf.push_str(&format!(
            "# OpenVPN client configuration for {}\n",
            connection.airport_id
        ));
        conf.push_str(&format!("# Connection: {}\n", connection.connection_name));
        conf.push_str("\n");
        conf.push_str("client\n");
        conf.push_str("dev tun\n");
        conf.push_str("proto udp\n");
        conf.push_str(&format!("remote {} {}\n", self.server_addr, OPENVPN_PORT));
        conf.push_str("resolv-retry infinite\n");
        conf.push_str("nobind\n");
        conf.push_str("persist-key\n");
        conf.push_str("persist-tun\n");
        conf.push_str("\n");
        conf.push_str("# PSK (shared secret)\n");
        conf.push_str("<secret>\n");
        conf.push_str(&format!("{}\n", psk));
        conf.push_str("</secret>\n");
        conf.push_str("\n");
        conf.push_str("# Cipher settings\n");
        conf.push_str("cipher AES-256-CBC\n");
        conf.push_str("auth SHA256\n");
        conf.push_str("\n");
        conf.push_str("# Compression\n");
        conf.push_str("comp-lzo\n");
        conf.push_str("\n");
        conf.push_str("verb 3\n");
        conf.push_str(&format!("route {} 255.255.255.255\n", connection.remote_subnet));

        Ok(conf)
    }

    async fn generate_secret_material(&self) -> VpnResult<SecretMaterial> {
        Ok(SecretMaterial::Psk(common::generate_psk()))
    }

    async fn ensure_secret_material(
        &self,
        record: &mut VpnRecord,
        shared: &mut SharedSecrets,
    ) -> VpnResult<bool> {
        let secrets = record.openvpn.get_or_insert_with(Default::default);
        let existing = secrets
            .psk
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        // One static key serves every site; prefer any key already present.
        if shared.shared_psk.is_none() {
            shared.shared_psk = Some(match existing {
                Some(psk) => psk.to_string(),
                None => common::generate_psk(),
            });
        }

        if existing.is_some() {
            return Ok(false);
        }

        secrets.psk = shared.shared_psk.clone();
        Ok(true)
    }

    async fn check_connection_status(&self, _connection_name: &str) -> ConnectionStatus {
        // One server process carries every site; its presence is the state.
        let output = match common::run_command("pgrep", &["-f", "openvpn.*server.conf"]).await {
            Ok(output) => output,
            Err(e) => return ConnectionStatus::down(e.to_string()),
        };

        if output.status.success() {
            ConnectionStatus::up("OpenVPN server running")
        } else {
            ConnectionStatus::down("OpenVPN server not running")
        }
    }

    async fn health_check(&self, _connection_name: &str, remote_subnet: Ipv4Net) -> bool {
        match common::run_command("pgrep", &["-f", "openvpn.*server.conf"]).await {
            Ok(output) if output.status.success() => {}
            _ => return false,
        }

        common::probe_gateway(remote_subnet).await
    }
}
