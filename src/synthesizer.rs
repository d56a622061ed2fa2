//! Config synthesis
//!
//! One synthesis pass turns the airports document into the full artifact
//! set. Missing secrets and client addresses are back-filled into the
//! document first, then every protocol's server files and every site's
//! client file are materialized through atomic writes. A failure in one
//! protocol group or one site never blocks the rest of the pass.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use tracing::{debug, error, info, warn};

use crate::allocator;
use crate::config::{AirportsFile, ResolvedConnection, VpnProtocol};
use crate::error::VpnResult;
use crate::persist;
use crate::settings::Settings;
use crate::vpn::handler::{Artifact, HandlerRegistry, ProtocolHandler, SharedSecrets};

/// Outcome of one synthesis pass.
#[derive(Debug, Default)]
pub struct SynthesisReport {
    /// The document was mutated by back-fill and needs saving.
    pub dirty: bool,
    /// Resolved connections keyed by connection name.
    pub connections: BTreeMap<String, ResolvedConnection>,
    /// Isolated failures, one entry per protocol group or site that failed.
    pub failures: Vec<String>,
}

/// Name of the downloadable client file for one site.
pub fn client_file_name(airport_id: &str, protocol: VpnProtocol) -> String {
    match protocol {
        VpnProtocol::Openvpn => format!("{}_openvpn.ovpn", airport_id),
        _ => format!("{}_{}.conf", airport_id, protocol),
    }
}

/// Drives one synthesis pass over the airports document.
pub struct Synthesizer<'a> {
    handlers: &'a HandlerRegistry,
    vpn_subnet: Ipv4Net,
    client_config_dir: PathBuf,
}

impl<'a> Synthesizer<'a> {
    pub fn new(handlers: &'a HandlerRegistry, settings: &Settings) -> Self {
        Self {
            handlers,
            vpn_subnet: settings.network.vpn_subnet,
            client_config_dir: settings.paths.client_config_dir.clone(),
        }
    }

    /// Back-fill the document, then materialize every artifact.
    pub async fn synthesize(&self, file: &mut AirportsFile) -> SynthesisReport {
        let mut report = SynthesisReport::default();

        report.dirty |= self.fill_secrets(file, &mut report.failures).await;
        report.dirty |= self.fill_client_addresses(file, &mut report.failures);

        report.connections = file.resolve_connections();

        self.write_server_artifacts(&report.connections, &mut report.failures)
            .await;
        self.write_client_configs(&report.connections, &mut report.failures)
            .await;

        report
    }

    /// Shared secret scratch per protocol, seeded from whatever the records
    /// already carry so an established deployment never regenerates.
    fn seed_shared(&self, file: &AirportsFile) -> BTreeMap<VpnProtocol, SharedSecrets> {
        let mut shared: BTreeMap<VpnProtocol, SharedSecrets> = BTreeMap::new();

        for id in file.enabled_site_ids() {
            let record = match file.vpn_record(&id) {
                Some(record) => record,
                None => continue,
            };
            let protocol = match record.protocol() {
                Ok(protocol) => protocol,
                Err(_) => continue,
            };
            let entry = shared.entry(protocol).or_default();

            match protocol {
                VpnProtocol::Wireguard => {
                    if entry.server_keypair.is_none() {
                        entry.server_keypair =
                            record.wireguard.as_ref().and_then(|k| k.server_pair());
                    }
                }
                VpnProtocol::Openvpn => {
                    if entry.shared_psk.is_none() {
                        entry.shared_psk = record
                            .openvpn
                            .as_ref()
                            .and_then(|o| o.psk.clone())
                            .filter(|p| !p.trim().is_empty());
                    }
                }
                VpnProtocol::Ipsec => {}
            }
        }

        shared
    }

    async fn fill_secrets(&self, file: &mut AirportsFile, failures: &mut Vec<String>) -> bool {
        let mut shared = self.seed_shared(file);
        let mut dirty = false;

        for id in file.enabled_site_ids() {
            let protocol = match file.vpn_record(&id).map(|r| r.protocol()) {
                Some(Ok(protocol)) => protocol,
                // Unknown type is reported at resolve time.
                Some(Err(_)) | None => continue,
            };
            let handler = match self.handlers.get(&protocol) {
                Some(handler) => handler,
                None => continue,
            };
            let shared_entry = shared.entry(protocol).or_default();
            let record = match file.vpn_record_mut(&id) {
                Some(record) => record,
                None => continue,
            };

            match handler.ensure_secret_material(record, shared_entry).await {
                Ok(true) => {
                    info!("Generated {} secret material for {}", protocol, id);
                    dirty = true;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Secret generation failed for {}: {}", id, e);
                    failures.push(format!("{}: {}", id, e));
                }
            }
        }

        dirty
    }

    /// Assign addresses to WireGuard/OpenVPN records that have none. An
    /// invalid operator-written value is left alone for `check` to flag.
    fn fill_client_addresses(&self, file: &mut AirportsFile, failures: &mut Vec<String>) -> bool {
        let mut in_use = file.in_use_addresses();
        let mut dirty = false;

        for id in file.enabled_site_ids() {
            let needs_address = match file.vpn_record(&id) {
                Some(record) => {
                    matches!(
                        record.protocol(),
                        Ok(VpnProtocol::Wireguard) | Ok(VpnProtocol::Openvpn)
                    ) && record
                        .client_ip
                        .as_deref()
                        .map(str::trim)
                        .map(|s| s.is_empty())
                        .unwrap_or(true)
                }
                None => false,
            };
            if !needs_address {
                continue;
            }

            match allocator::next_client_address(self.vpn_subnet, &in_use) {
                Ok(address) => {
                    in_use.insert(address.addr());
                    if let Some(record) = file.vpn_record_mut(&id) {
                        info!("Assigned client address {} to {}", address, id);
                        record.client_ip = Some(address.to_string());
                        dirty = true;
                    }
                }
                Err(e) => {
                    error!("Address assignment failed for {}: {}", id, e);
                    failures.push(format!("{}: {}", id, e));
                }
            }
        }

        dirty
    }

    async fn write_artifact(&self, artifact: &Artifact) -> VpnResult<()> {
        if let Some(parent) = artifact.path.parent() {
            persist::ensure_directory_exists(parent).await?;
        }
        persist::write_atomic(&artifact.path, &artifact.content, artifact.mode).await
    }

    async fn write_protocol_artifacts(
        &self,
        handler: &dyn ProtocolHandler,
        group: &[&ResolvedConnection],
    ) -> VpnResult<()> {
        for artifact in handler.server_artifacts(group)? {
            self.write_artifact(&artifact).await?;
        }
        Ok(())
    }

    /// Every protocol renders every cycle, empty groups included, so
    /// removing the last site of a protocol also clears its server config.
    async fn write_server_artifacts(
        &self,
        connections: &BTreeMap<String, ResolvedConnection>,
        failures: &mut Vec<String>,
    ) {
        for (protocol, handler) in self.handlers {
            let group: Vec<&ResolvedConnection> = connections
                .values()
                .filter(|c| c.protocol == *protocol)
                .collect();

            match self.write_protocol_artifacts(handler.as_ref(), &group).await {
                Ok(()) => {
                    debug!("{} server artifacts written ({} connections)", protocol, group.len())
                }
                Err(e) => {
                    error!("{} artifact generation failed: {}", protocol, e);
                    failures.push(format!("{}: {}", protocol, e));
                }
            }
        }
    }

    async fn write_client_configs(
        &self,
        connections: &BTreeMap<String, ResolvedConnection>,
        failures: &mut Vec<String>,
    ) {
        for conn in connections.values() {
            let handler = match self.handlers.get(&conn.protocol) {
                Some(handler) => handler,
                None => continue,
            };

            let content = match handler.generate_client_config(conn) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Client config for {} skipped: {}", conn.airport_id, e);
                    failures.push(format!("{}: {}", conn.airport_id, e));
                    continue;
                }
            };

            let artifact = Artifact {
                path: self
                    .client_config_dir
                    .join(client_file_name(&conn.airport_id, conn.protocol)),
                content,
                mode: persist::MODE_SECRET,
            };
            if let Err(e) = self.write_artifact(&artifact).await {
                error!("Client config write for {} failed: {}", conn.airport_id, e);
                failures.push(format!("{}: {}", conn.airport_id, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn;

    fn test_settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.paths.ipsec_dir = dir.join("ipsec");
        settings.paths.wireguard_dir = dir.join("wireguard");
        settings.paths.openvpn_dir = dir.join("openvpn");
        settings.paths.client_config_dir = dir.join("clients");
        settings
    }

    fn sample_file() -> AirportsFile {
        // WireGuard site carries full keys so synthesis never needs the
        // wg tool in the test environment.
        serde_json::from_str(
            r#"{
            "airports": {
                "kbfi": {
                    "vpn": {
                        "enabled": true,
                        "type": "ipsec",
                        "remote_subnet": "192.168.50.0/24"
                    }
                },
                "kpae": {
                    "vpn": {
                        "enabled": true,
                        "type": "wireguard",
                        "remote_subnet": "192.168.60.0/24",
                        "wireguard": {
                            "server_private_key": "spriv",
                            "server_public_key": "spub",
                            "client_private_key": "cpriv",
                            "client_public_key": "cpub"
                        }
                    }
                },
                "kone": {
                    "vpn": {
                        "enabled": true,
                        "type": "openvpn",
                        "remote_subnet": "192.168.70.0/24"
                    }
                }
            }
        }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_synthesis_backfills_and_writes_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = test_settings(dir.path());
        let handlers = vpn::build_handlers(&settings, "203.0.113.10");
        let synthesizer = Synthesizer::new(&handlers, &settings);
        let mut file = sample_file();

        let report = synthesizer.synthesize(&mut file).await;

        assert!(report.dirty);
        assert!(report.failures.is_empty(), "failures: {:?}", report.failures);
        assert_eq!(report.connections.len(), 3);

        // Secrets were filled into the document.
        assert_eq!(file.vpn_record("kbfi").unwrap().psk.as_ref().unwrap().len(), 64);
        assert!(file.vpn_record("kone").unwrap().openvpn.as_ref().unwrap().psk.is_some());

        // Addresses were assigned to the address-bearing protocols only.
        let kpae_ip = file.vpn_record("kpae").unwrap().client_ip.clone().unwrap();
        let kone_ip = file.vpn_record("kone").unwrap().client_ip.clone().unwrap();
        assert_ne!(kpae_ip, kone_ip);
        assert!(kpae_ip.ends_with("/32"));
        assert!(file.vpn_record("kbfi").unwrap().client_ip.is_none());

        // Server artifacts for all three protocols.
        assert!(dir.path().join("ipsec/ipsec.conf").exists());
        assert!(dir.path().join("ipsec/ipsec.secrets").exists());
        assert!(dir.path().join("wireguard/wg0.conf").exists());
        assert!(dir.path().join("openvpn/server.conf").exists());
        assert!(dir.path().join("openvpn/psk.key").exists());

        // Per-site client configs.
        assert!(dir.path().join("clients/kbfi_ipsec.conf").exists());
        assert!(dir.path().join("clients/kpae_wireguard.conf").exists());
        assert!(dir.path().join("clients/kone_openvpn.ovpn").exists());
    }

    #[tokio::test]
    async fn test_second_pass_is_clean() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = test_settings(dir.path());
        let handlers = vpn::build_handlers(&settings, "203.0.113.10");
        let synthesizer = Synthesizer::new(&handlers, &settings);
        let mut file = sample_file();

        let first = synthesizer.synthesize(&mut file).await;
        assert!(first.dirty);

        let before = serde_json::to_string(&file).unwrap();
        let second = synthesizer.synthesize(&mut file).await;
        assert!(!second.dirty);
        assert_eq!(serde_json::to_string(&file).unwrap(), before);
    }

    #[tokio::test]
    async fn test_empty_document_still_writes_every_protocol() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = test_settings(dir.path());
        let handlers = vpn::build_handlers(&settings, "203.0.113.10");
        let synthesizer = Synthesizer::new(&handlers, &settings);
        let mut file = AirportsFile::default();

        let report = synthesizer.synthesize(&mut file).await;

        assert!(!report.dirty);
        assert!(report.connections.is_empty());
        assert!(dir.path().join("ipsec/ipsec.conf").exists());
        assert!(dir.path().join("wireguard/wg0.conf").exists());
        assert!(dir.path().join("openvpn/server.conf").exists());
    }

    #[tokio::test]
    async fn test_openvpn_psk_shared_across_sites() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = test_settings(dir.path());
        let handlers = vpn::build_handlers(&settings, "203.0.113.10");
        let synthesizer = Synthesizer::new(&handlers, &settings);

        let mut file: AirportsFile = serde_json::from_str(
            r#"{
            "airports": {
                "aaa": {"vpn": {"enabled": true, "type": "openvpn",
                                "remote_subnet": "10.1.0.0/24",
                                "openvpn": {"psk": "presetpsk"}}},
                "bbb": {"vpn": {"enabled": true, "type": "openvpn",
                                "remote_subnet": "10.2.0.0/24"}}
            }
        }"#,
        )
        .unwrap();

        synthesizer.synthesize(&mut file).await;

        // The preset key wins and spreads to the unkeyed site.
        let aaa = file.vpn_record("aaa").unwrap().openvpn.clone().unwrap().psk.unwrap();
        let bbb = file.vpn_record("bbb").unwrap().openvpn.clone().unwrap().psk.unwrap();
        assert_eq!(aaa, "presetpsk");
        assert_eq!(bbb, "presetpsk");

        let psk_file = std::fs::read_to_string(dir.path().join("openvpn/psk.key")).unwrap();
        assert_eq!(psk_file, "presetpsk\n");
    }

    #[test]
    fn test_client_file_names() {
        assert_eq!(client_file_name("kbfi", VpnProtocol::Ipsec), "kbfi_ipsec.conf");
        assert_eq!(client_file_name("kpae", VpnProtocol::Wireguard), "kpae_wireguard.conf");
        assert_eq!(client_file_name("kone", VpnProtocol::Openvpn), "kone_openvpn.ovpn");
    }
}
