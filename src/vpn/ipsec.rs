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

/// IPsec/IKEv2 handler backed by strongSwan.
///
/// Site gateways authenticate with per-site PSKs; every tunnel shares one
/// ipsec.conf / ipsec.secrets pair under the strongSwan config directory.
pub struct IpsecHandler {
    server_addr: String,
    local_id: String,
    config_dir: PathBuf,
}

/// DH group number to modp bit length. Unknown groups fall back to 2048.
fn dh_group_bits(group: &str) -> &'static str {
    match group {
        "14" => "2048",
        "15" => "3072",
        "16" => "4096",
        "17" => "6144",
        "18" => "8192",
        _ => "2048",
    }
}

impl IpsecHandler {
    pub fn new(server_addr: String, local_id: String, config_dir: PathBuf) -> Self {
        Self { server_addr, local_id, config_dir }
    }

    /// Build the ipsec.secrets companion file, one PSK line per tunnel.
    fn build_secrets(&self, connections: &[&ResolvedConnection]) -> String {
        let mut secrets = String::new();
        secrets.push_str("# IPsec secrets\n");
        secrets.push_str("# Auto-generated from airports.json\n");
        secrets.push_str("\n");

        for conn in connections {
            match &conn.psk {
                Some(psk) => {
                    secrets.push_str(&format!(": PSK \"{}\"\n", psk));
                }
                None => {
                    warn!("PSK not configured for {}", conn.connection_name);
                }
            }
        }

        secrets
    }
}

#[async_trait]
impl ProtocolHandler for IpsecHandler {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::Ipsec
    }

    async fn is_available(&self) -> bool {
        common::check_binary_available("ipsec").await
    }

    fn generate_server_config(&self, connections: &[&ResolvedConnection]) -> VpnResult<String> {
        let mut conf = String::new();
        conf.push_str("# strongSwan IPsec configuration\n");
        conf.push_str("# Auto-generated from airports.json\n");
        conf.push_str("\n");
        conf.push_str("config setup\n");
        conf.push_str("    charondebug=\"ike 2, knl 2, cfg 2\"\n");
        conf.push_str("    uniqueids=never\n");
        conf.push_str("    strictcrlpolicy=no\n");

        for conn in connections {
            let dh_bits = dh_group_bits(&conn.dh_group);

            conf.push_str("\n");
            conf.push_str(&format!("# Connection for {} airport\n", conn.airport_id));
            conf.push_str(&format!("conn {}\n", conn.connection_name));
            conf.push_str("    type=tunnel\n");
            conf.push_str("    auto=add\n");
            conf.push_str(&format!("    keyexchange=ikev{}\n", conn.ike_version));
            conf.push_str(&format!("    ike={}-sha256-modp{}!\n", conn.encryption, dh_bits));
            conf.push_str(&format!("    esp={}-sha256-modp{}!\n", conn.encryption, dh_bits));
            conf.push_str("    left=%defaultroute\n");
            conf.push_str(&format!("    leftid={}\n", self.local_id));
            conf.push_str("    leftsubnet=0.0.0.0/0\n");
            conf.push_str("    leftauth=psk\n");
            conf.push_str("    right=%any\n");
            conf.push_str(&format!("    rightid=@{}.remote\n", conn.airport_id));
            conf.push_str(&format!("    rightsubnet={}\n", conn.remote_subnet));
            conf.push_str("    rightauth=psk\n");
            conf.push_str("    dpdaction=restart\n");
            conf.push_str("    dpddelay=30s\n");
            conf.push_str("    dpdtimeout=120s\n");
            conf.push_str("    rekey=yes\n");
            conf.push_str("    reauth=yes\n");
            conf.push_str("    fragmentation=yes\n");
            conf.push_str("    forceencaps=yes\n");
        }

        Ok(conf)
    }

    fn server_artifacts(&self, connections: &[&ResolvedConnection]) -> VpnResult<Vec<Artifact>> {
        Ok(vec![
            Artifact {
                path: self.config_dir.join("ipsec.conf"),
                content: self.generate_server_config(connections)?,
                mode: persist::MODE_PUBLIC,
            },
            Artifact {
                path: self.config_dir.join("ipsec.secrets"),
                content: self.build_secrets(connections),
                mode: persist::MODE_SECRET,
            },
        ])
    }

    /// IPsec site gateways are configured by hand, so the export is an
    /// instruction sheet carrying the gateway-side settings and the PSK.
    fn generate_client_config(&self, connection: &ResolvedConnection) -> VpnResult<String> {
        let psk = connection.psk.as_deref().ok_or_else(|| {
            VpnError::MissingCredential(format!("PSK for {}", connection.connection_name))
        })?;

        let mut conf = String::new();
        conf.push_str(&format!(
            "# IPsec/IKEv2 client configuration for {}\n",
            connection.airport_id
        ));
        conf.push_str("# Manual configuration required. Import these settings into the site gateway.\n");
        conf.push_str("\n");
        conf.push_str("# Connection settings:\n");
        conf.push_str(&format!("# - Peer IP: {}\n", self.server_addr));
        conf.push_str(&format!("# - Pre-Shared Key: {}\n", psk));
        conf.push_str(&format!("# - Remote Subnet: {}\n", connection.remote_subnet));
        conf.push_str(&format!("# - IKE Version: {}\n", connection.ike_version));
        conf.push_str(&format!("# - Encryption: {}\n", connection.encryption));
        conf.push_str(&format!("# - DH Group: {}\n", connection.dh_group));
        conf.push_str("\n");
        conf.push_str("# For UniFi gateways:\n");
        conf.push_str("# 1. Navigate to Settings > VPN > Site-to-Site VPN\n");
        conf.push_str("# 2. Add a new connection:\n");
        conf.push_str("#    - Type: Manual IPsec\n");
        conf.push_str(&format!("#    - Peer IP: {}\n", self.server_addr));
        conf.push_str(&format!("#    - Pre-Shared Key: {}\n", psk));
        conf.push_str(&format!("#    - Remote Subnets: {}\n", connection.remote_subnet));
        conf.push_str(&format!("#    - IKE Version: {}\n", connection.ike_version));
        conf.push_str(&format!("#    - Encryption: {}\n", connection.encryption));
        conf.push_str("#    - Hash: SHA-256\n");
        conf.push_str(&format!("#    - DH Group: {}\n", connection.dh_group));

        Ok(conf)
    }

    async fn generate_secret_material(&self) -> VpnResult<SecretMaterial> {
        Ok(SecretMaterial::Psk(common::generate_psk()))
    }

    async fn ensure_secret_material(
        &self,
        record: &mut VpnRecord,
        _shared: &mut SharedSecrets,
    ) -> VpnResult<bool> {
        let has_psk = record
            .psk
            .as_deref()
            .map(str::trim)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if has_psk {
            return Ok(false);
        }

        record.psk = Some(common::generate_psk());
        Ok(true)
    }

    async fn check_connection_status(&self, connection_name: &str) -> ConnectionStatus {
        let output = match common::run_command("ipsec", &["status", connection_name]).await {
            Ok(output) => output,
            Err(e) => return ConnectionStatus::down(e.to_string()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lowered = stdout.to_lowercase();
        let detail = stdout.trim().to_string();

        if lowered.contains("established") {
            ConnectionStatus::up(detail)
        } else if lowered.contains("connecting") || lowered.contains("initiating") {
            ConnectionStatus::connecting(detail)
        } else {
            ConnectionStatus::down(detail)
        }
    }

    async fn health_check(&self, _connection_name: &str, remote_subnet: Ipv4Net) -> bool {
        common::probe_gateway(remote_subnet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> IpsecHandler {
        IpsecHandler::new(
            "203.0.113.10".to_string(),
            "@vpn.server".to_string(),
            PathBuf::from("/etc/ipsec-shared"),
        )
    }

    fn connection(airport_id: &str, psk: Option<&str>) -> ResolvedConnection {
        ResolvedConnection {
            airport_id: airport_id.to_string(),
            connection_name: format!("{}_vpn", airport_id),
            protocol: VpnProtocol::Ipsec,
            remote_subnet: "192.168.50.0/24".parse().unwrap(),
            client_ip: None,
            psk: psk.map(String::from),
            ike_version: "2".to_string(),
            encryption: "aes256gcm128".to_string(),
            dh_group: "14".to_string(),
            wireguard: Default::default(),
            openvpn_psk: None,
        }
    }

    #[test]
    fn test_empty_config_is_still_valid() {
        let conf = handler().generate_server_config(&[]).unwrap();
        assert!(conf.contains("config setup"));
        assert!(conf.contains("uniqueids=never"));
        assert!(!conf.contains("conn "));
        assert!(conf.ends_with("strictcrlpolicy=no\n"));
    }

    #[test]
    fn test_conn_stanza_fields() {
        let conn = connection("kbfi", Some("sekrit"));
        let conf = handler().generate_server_config(&[&conn]).unwrap();

        assert!(conf.contains("conn kbfi_vpn\n"));
        assert!(conf.contains("    keyexchange=ikev2\n"));
        assert!(conf.contains("    ike=aes256gcm128-sha256-modp2048!\n"));
        assert!(conf.contains("    esp=aes256gcm128-sha256-modp2048!\n"));
        assert!(conf.contains("    leftid=@vpn.server\n"));
        assert!(conf.contains("    rightid=@kbfi.remote\n"));
        assert!(conf.contains("    rightsubnet=192.168.50.0/24\n"));
        assert!(conf.contains("    forceencaps=yes\n"));
    }

    #[test]
    fn test_dh_group_mapping() {
        let mut conn = connection("kbfi", Some("sekrit"));
        conn.dh_group = "16".to_string();
        let conf = handler().generate_server_config(&[&conn]).unwrap();
        assert!(conf.contains("modp4096!"));

        conn.dh_group = "99".to_string();
        let conf = handler().generate_server_config(&[&conn]).unwrap();
        assert!(conf.contains("modp2048!"));
    }

    #[test]
    fn test_secrets_one_line_per_psk() {
        let with = connection("kbfi", Some("alpha"));
        let without = connection("kpae", None);
        let secrets = handler().build_secrets(&[&with, &without]);

        assert!(secrets.contains(": PSK \"alpha\"\n"));
        assert_eq!(secrets.matches(": PSK").count(), 1);
    }

    #[test]
    fn test_server_artifacts_paths_and_modes() {
        let conn = connection("kbfi", Some("sekrit"));
        let artifacts = handler().server_artifacts(&[&conn]).unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].path, PathBuf::from("/etc/ipsec-shared/ipsec.conf"));
        assert_eq!(artifacts[0].mode, 0o644);
        assert_eq!(artifacts[1].path, PathBuf::from("/etc/ipsec-shared/ipsec.secrets"));
        assert_eq!(artifacts[1].mode, 0o600);
        assert!(artifacts[1].content.contains("sekrit"));
    }

    #[test]
    fn test_client_config_carries_settings() {
        let conn = connection("kbfi", Some("sekrit"));
        let conf = handler().generate_client_config(&conn).unwrap();

        assert!(conf.contains("# - Peer IP: 203.0.113.10"));
        assert!(conf.contains("# - Pre-Shared Key: sekrit"));
        assert!(conf.contains("# - Remote Subnet: 192.168.50.0/24"));
        assert!(conf.contains("#    - Hash: SHA-256"));
    }

    #[test]
    fn test_client_config_requires_psk() {
        let conn = connection("kbfi", None);
        let err = handler().generate_client_config(&conn).unwrap_err();
        assert!(matches!(err, VpnError::MissingCredential(_)));
        // The failure must name the connection, never echo material.
        assert!(err.to_string().contains("kbfi_vpn"));
    }

    #[tokio::test]
    async fn test_generated_psk_is_256_bit_hex() {
        let material = handler().generate_secret_material().await.unwrap();
        match material {
            SecretMaterial::Psk(psk) => {
                assert_eq!(psk.len(), 64);
                assert!(psk.chars().all(|c| c.is_ascii_hexdigit()));
            }
            other => panic!("unexpected material: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ensure_secret_material_is_idempotent() {
        let handler = handler();
        let mut record = VpnRecord::default();
        let mut shared = SharedSecrets::default();

        assert!(handler.ensure_secret_material(&mut record, &mut shared).await.unwrap());
        let first = record.psk.clone().unwrap();
        assert_eq!(first.len(), 64);

        assert!(!handler.ensure_secret_material(&mut record, &mut shared).await.unwrap());
        assert_eq!(record.psk.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn test_status_without_daemon_is_down() {
        // No strongSwan in the test environment; the query must degrade
        // to down instead of erroring.
        let status = handler().check_connection_status("kbfi_vpn").await;
        assert_eq!(status.state, crate::vpn::handler::TunnelState::Down);
    }
}
