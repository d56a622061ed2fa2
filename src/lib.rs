//! vpnmgr - Site-to-Site VPN Orchestration Library
//!
//! Async library for maintaining site-to-site VPN tunnels between a
//! central server and remote airport stations:
//! - Declarative airports configuration (JSON) with secret back-fill
//! - Tunnel configuration synthesis (IPsec/IKEv2, WireGuard, OpenVPN)
//! - Client address allocation inside a shared VPN subnet
//! - Connection status, session tracking and health probing
//! - Atomic artifact persistence with secret-aware permissions
//!
//! The `vpnmgrd` daemon drives the reconciliation loop; `vpncli` offers
//! operator commands on top of the same library.

pub mod allocator;
pub mod config;
pub mod error;
pub mod monitor;
pub mod persist;
pub mod settings;
pub mod status;
pub mod synthesizer;
pub mod vpn;

// Re-export commonly used types
pub use error::{VpnError, VpnResult};
pub use config::{
    AirportEntry, AirportsFile, ConfigStore, OpenVpnSecrets, ResolvedConnection, SiteFindings,
    VpnProtocol, VpnRecord, WireGuardKeys,
};
pub use monitor::VpnManager;
pub use settings::Settings;
pub use status::{ConnectionReport, HealthState, SessionTracker, StatusSnapshot};
pub use synthesizer::{SynthesisReport, Synthesizer};
pub use vpn::{
    Artifact, ConnectionStatus, HandlerRegistry, ProtocolHandler, SecretMaterial, TunnelState,
};
