//! Aggregated tunnel status
//!
//! Each cycle publishes one snapshot JSON document consumed by dashboards
//! and the CLI. Session times are tracked here across cycles so the
//! snapshot carries real connect/disconnect history instead of the
//! daemon's instantaneous view.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::VpnProtocol;
use crate::vpn::handler::TunnelState;

/// Result of the most recent reachability probe for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Pass,
    Fail,
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Pass => f.write_str("pass"),
            HealthState::Fail => f.write_str("fail"),
            HealthState::Unknown => f.write_str("unknown"),
        }
    }
}

/// Per-connection entry in the published snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub airport_id: String,
    pub connection_name: String,
    pub protocol: VpnProtocol,
    pub status: TunnelState,
    /// Unix seconds of the most recent down-to-up transition, 0 if never
    pub last_connected: i64,
    /// Unix seconds of the most recent up-to-down transition, 0 if never
    pub last_disconnected: i64,
    /// Seconds since the current session started, 0 while down
    pub uptime_seconds: i64,
    pub health_check: HealthState,
}

/// Whole snapshot document, replaced atomically every cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp: i64,
    pub connections: BTreeMap<String, ConnectionReport>,
}

/// Session times derived from one observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTimes {
    pub last_connected: i64,
    pub last_disconnected: i64,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Default)]
struct Session {
    session_start: Option<i64>,
    last_connected: i64,
    last_disconnected: i64,
}

/// Tracks per-connection up/down transitions across monitor cycles.
///
/// Only `Up` counts as connected; a connection observed `Connecting` after
/// being up has dropped its session. State lives in memory, so history
/// restarts with the daemon.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    sessions: BTreeMap<String, Session>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation and return the session times to publish.
    pub fn observe(&mut self, connection_name: &str, state: TunnelState, now: i64) -> SessionTimes {
        let session = self.sessions.entry(connection_name.to_string()).or_default();

        match state {
            TunnelState::Up => {
                if session.session_start.is_none() {
                    session.session_start = Some(now);
                    session.last_connected = now;
                }
            }
            TunnelState::Down | TunnelState::Connecting => {
                if session.session_start.take().is_some() {
                    session.last_disconnected = now;
                }
            }
        }

        SessionTimes {
            last_connected: session.last_connected,
            last_disconnected: session.last_disconnected,
            uptime_seconds: session
                .session_start
                .map(|start| (now - start).max(0))
                .unwrap_or(0),
        }
    }

    /// Drop state for connections no longer present in the configuration.
    pub fn retain_connections(&mut self, live: &[String]) {
        self.sessions.retain(|name, _| live.iter().any(|l| l == name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_up_starts_session() {
        let mut tracker = SessionTracker::new();
        let times = tracker.observe("kbfi_vpn", TunnelState::Up, 1000);
        assert_eq!(times.last_connected, 1000);
        assert_eq!(times.last_disconnected, 0);
        assert_eq!(times.uptime_seconds, 0);
    }

    #[test]
    fn test_uptime_grows_while_up() {
        let mut tracker = SessionTracker::new();
        tracker.observe("kbfi_vpn", TunnelState::Up, 1000);
        let times = tracker.observe("kbfi_vpn", TunnelState::Up, 1090);
        assert_eq!(times.last_connected, 1000);
        assert_eq!(times.uptime_seconds, 90);
    }

    #[test]
    fn test_down_ends_session() {
        let mut tracker = SessionTracker::new();
        tracker.observe("kbfi_vpn", TunnelState::Up, 1000);
        let times = tracker.observe("kbfi_vpn", TunnelState::Down, 1060);
        assert_eq!(times.last_connected, 1000);
        assert_eq!(times.last_disconnected, 1060);
        assert_eq!(times.uptime_seconds, 0);

        // History persists through further down observations.
        let times = tracker.observe("kbfi_vpn", TunnelState::Down, 1120);
        assert_eq!(times.last_connected, 1000);
        assert_eq!(times.last_disconnected, 1060);
    }

    #[test]
    fn test_reconnect_starts_new_session() {
        let mut tracker = SessionTracker::new();
        tracker.observe("kbfi_vpn", TunnelState::Up, 1000);
        tracker.observe("kbfi_vpn", TunnelState::Down, 1060);
        let times = tracker.observe("kbfi_vpn", TunnelState::Up, 1200);
        assert_eq!(times.last_connected, 1200);
        assert_eq!(times.last_disconnected, 1060);
        assert_eq!(times.uptime_seconds, 0);
    }

    #[test]
    fn test_connecting_is_not_a_session() {
        let mut tracker = SessionTracker::new();
        let times = tracker.observe("kbfi_vpn", TunnelState::Connecting, 1000);
        assert_eq!(times.last_connected, 0);
        assert_eq!(times.uptime_seconds, 0);

        tracker.observe("kbfi_vpn", TunnelState::Up, 1030);
        let times = tracker.observe("kbfi_vpn", TunnelState::Connecting, 1090);
        assert_eq!(times.last_disconnected, 1090);
        assert_eq!(times.uptime_seconds, 0);
    }

    #[test]
    fn test_retain_drops_removed_connections() {
        let mut tracker = SessionTracker::new();
        tracker.observe("keep_vpn", TunnelState::Up, 1000);
        tracker.observe("drop_vpn", TunnelState::Up, 1000);

        tracker.retain_connections(&["keep_vpn".to_string()]);

        let kept = tracker.observe("keep_vpn", TunnelState::Up, 1100);
        assert_eq!(kept.last_connected, 1000);
        // Fresh entry: its first up starts a new session.
        let dropped = tracker.observe("drop_vpn", TunnelState::Up, 1100);
        assert_eq!(dropped.last_connected, 1100);
    }

    #[test]
    fn test_snapshot_serialization_shape() {
        let mut snapshot = StatusSnapshot { timestamp: 1700000000, ..Default::default() };
        snapshot.connections.insert(
            "kbfi_vpn".to_string(),
            ConnectionReport {
                airport_id: "kbfi".to_string(),
                connection_name: "kbfi_vpn".to_string(),
                protocol: VpnProtocol::Ipsec,
                status: TunnelState::Up,
                last_connected: 1699999000,
                last_disconnected: 0,
                uptime_seconds: 1000,
                health_check: HealthState::Pass,
            },
        );

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(json["timestamp"], 1700000000i64);
        let report = &json["connections"]["kbfi_vpn"];
        assert_eq!(report["protocol"], "ipsec");
        assert_eq!(report["status"], "up");
        assert_eq!(report["health_check"], "pass");
        assert_eq!(report["uptime_seconds"], 1000);
    }
}
