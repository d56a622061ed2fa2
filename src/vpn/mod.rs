//! Tunnel protocol handlers
//!
//! This module holds one handler per supported tunnel protocol behind the
//! common `ProtocolHandler` trait. Handlers own artifact generation, secret
//! back-fill, and daemon queries for their protocol; the synthesizer and
//! monitor drive them uniformly through the registry.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Synthesizer / Monitor (drivers)   │
//! └──────────────┬──────────────────────┘
//!                │  HandlerRegistry
//!     ┌──────────┼──────────┐
//!     │          │          │
//!     ▼          ▼          ▼
//! ┌───────┐  ┌───────┐  ┌───────┐
//! │ IPsec │  │  WG   │  │ OVPN  │   <- ProtocolHandler impls
//! └───────┘  └───────┘  └───────┘
//! ```
//!
//! No tunnel protocol is implemented here; every handler generates the
//! files an external daemon consumes and queries that daemon as an opaque
//! oracle.

pub mod common;
pub mod handler;
pub mod ipsec;
pub mod openvpn;
pub mod wireguard;

pub use handler::{
    Artifact, ConnectionStatus, HandlerRegistry, ProtocolHandler, SecretMaterial, SharedSecrets,
    TunnelState, WgKeySet,
};

use crate::config::VpnProtocol;
use crate::settings::Settings;

/// Build the full handler registry for the given settings and resolved
/// public server address.
pub fn build_handlers(settings: &Settings, server_addr: &str) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.insert(
        VpnProtocol::Ipsec,
        Box::new(ipsec::IpsecHandler::new(
            server_addr.to_string(),
            settings.network.local_id.clone(),
            settings.paths.ipsec_dir.clone(),
        )) as Box<dyn ProtocolHandler>,
    );
    handlers.insert(
        VpnProtocol::Wireguard,
        Box::new(wireguard::WireguardHandler::new(
            server_addr.to_string(),
            settings.network.vpn_subnet,
            settings.paths.wireguard_dir.clone(),
        )),
    );
    handlers.insert(
        VpnProtocol::Openvpn,
        Box::new(openvpn::OpenvpnHandler::new(
            server_addr.to_string(),
            settings.network.vpn_subnet,
            settings.paths.openvpn_dir.clone(),
        )),
    );
    handlers
}
