//! VPN reconciliation and status loop
//!
//! The manager owns the periodic cycle: watch the airports file for
//! operator edits, re-synthesize tunnel configuration when it changes,
//! then query every tunnel daemon and publish a status snapshot. One
//! cycle never takes the process down; a failed cycle is logged and
//! retried after a backoff.

use crate::config::{ConfigStore, ResolvedConnection};
use crate::error::VpnResult;
use crate::persist;
use crate::settings::Settings;
use crate::status::{ConnectionReport, HealthState, SessionTracker, StatusSnapshot};
use crate::synthesizer::Synthesizer;
use crate::vpn::{self, HandlerRegistry, TunnelState};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Periodic VPN manager.
///
/// Holds the protocol handlers, the per-connection session history and
/// the health cache across cycles. Daemon binaries drive it through
/// [`VpnManager::run`]; `--once` mode calls [`VpnManager::run_cycle`]
/// directly.
pub struct VpnManager {
    settings: Settings,
    store: ConfigStore,
    handlers: HandlerRegistry,
    sessions: SessionTracker,
    /// Connections resolved during the last synthesis, keyed by
    /// connection name. Reused on cycles where the config is unchanged.
    connections: BTreeMap<String, ResolvedConnection>,
    /// Latest probe verdict per connection name.
    health: BTreeMap<String, HealthState>,
    /// When each connection was last probed, successful or not.
    last_probe: BTreeMap<String, Instant>,
    /// Config mtime as of the last synthesis, including our own
    /// back-fill writes so they do not count as operator edits.
    config_mtime: Option<SystemTime>,
    synthesized: bool,
    running: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
}

impl VpnManager {
    /// Create a manager for the given settings and resolved server address.
    pub fn new(settings: Settings, server_addr: &str) -> Self {
        let handlers = vpn::build_handlers(&settings, server_addr);
        let store = ConfigStore::new(settings.paths.config_path.clone());
        Self {
            settings,
            store,
            handlers,
            sessions: SessionTracker::new(),
            connections: BTreeMap::new(),
            health: BTreeMap::new(),
            last_probe: BTreeMap::new(),
            config_mtime: None,
            synthesized: false,
            running: Arc::new(RwLock::new(true)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Shared running flag, cleared by signal handlers for a graceful stop.
    pub fn running_flag(&self) -> Arc<RwLock<bool>> {
        self.running.clone()
    }

    /// Waker that interrupts the inter-cycle sleep so a cleared running
    /// flag is observed promptly.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run cycles until the running flag is cleared.
    pub async fn run(&mut self) -> VpnResult<()> {
        info!(
            "VPN manager started (update interval {}s)",
            self.settings.timing.update_interval_secs
        );

        while *self.running.read().await {
            let delay = self.run_cycle().await;
            let wake = self.wake.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake.notified() => {
                    debug!("Sleep interrupted, re-checking running flag");
                }
            }
        }

        info!("VPN manager stopped");
        Ok(())
    }

    /// Run one reconciliation cycle and return how long to sleep before
    /// the next one. Errors are contained here: a failed cycle logs and
    /// asks for the error backoff instead of the regular interval.
    pub async fn run_cycle(&mut self) -> Duration {
        match self.cycle().await {
            Ok(()) => Duration::from_secs(self.settings.timing.update_interval_secs),
            Err(e) => {
                error!("Cycle failed: {}", e);
                Duration::from_secs(self.settings.timing.error_backoff_secs)
            }
        }
    }

    async fn cycle(&mut self) -> VpnResult<()> {
        let mtime = self.store.mtime().await;
        let changed = !self.synthesized || mtime != self.config_mtime;

        if changed {
            if self.synthesized {
                info!("Configuration changed, re-synthesizing VPN artifacts");
            } else {
                info!("Performing initial synthesis");
            }

            let mut file = self.store.load().await?;
            let synthesizer = Synthesizer::new(&self.handlers, &self.settings);
            let report = synthesizer.synthesize(&mut file).await;
            if !report.failures.is_empty() {
                warn!(
                    "Synthesis completed with {} failure(s)",
                    report.failures.len()
                );
            }

            if report.dirty {
                self.store.save(&file).await?;
                // Re-stat so our own write is not mistaken for an edit.
                self.config_mtime = self.store.mtime().await;
            } else {
                self.config_mtime = mtime;
            }

            self.sessions
                .retain_connections(&report.connections.keys().cloned().collect::<Vec<_>>());
            self.health
                .retain(|name, _| report.connections.contains_key(name));
            self.last_probe
                .retain(|name, _| report.connections.contains_key(name));
            self.connections = report.connections;
            self.synthesized = true;
        }

        self.publish_status().await
    }

    /// Query every connection's daemon, fold the observations into the
    /// session history and write the snapshot file.
    async fn publish_status(&mut self) -> VpnResult<()> {
        let now = Utc::now().timestamp();
        let mut snapshot = StatusSnapshot {
            timestamp: now,
            connections: BTreeMap::new(),
        };

        let connections: Vec<ResolvedConnection> = self.connections.values().cloned().collect();
        for conn in connections {
            let handler = match self.handlers.get(&conn.protocol) {
                Some(handler) => handler,
                None => continue,
            };
            let name = conn.connection_name.clone();

            let status = handler.check_connection_status(&name).await;
            debug!("{}: {} ({})", name, status.state, status.detail);
            if status.state == TunnelState::Down {
                warn!("Connection {} is down", name);
            }
            let times = self.sessions.observe(&name, status.state, now);

            if status.state == TunnelState::Up && self.probe_due(&name) {
                let healthy = handler.health_check(&name, conn.remote_subnet).await;
                self.last_probe.insert(name.clone(), Instant::now());
                if !healthy {
                    warn!("Health check failed for {}", name);
                }
                self.health.insert(
                    name.clone(),
                    if healthy {
                        HealthState::Pass
                    } else {
                        HealthState::Fail
                    },
                );
            }

            // Health is only meaningful while the tunnel is up; a cached
            // verdict from a previous session is not republished for a
            // downed connection.
            let health = if status.state == TunnelState::Up {
                self.health.get(&name).copied().unwrap_or(HealthState::Unknown)
            } else {
                HealthState::Unknown
            };

            snapshot.connections.insert(
                name.clone(),
                ConnectionReport {
                    airport_id: conn.airport_id.clone(),
                    connection_name: name,
                    protocol: conn.protocol,
                    status: status.state,
                    last_connected: times.last_connected,
                    last_disconnected: times.last_disconnected,
                    uptime_seconds: times.uptime_seconds,
                    health_check: health,
                },
            );
        }

        self.write_snapshot(&snapshot).await
    }

    /// A probe is due when the connection has never been probed or the
    /// health interval has elapsed since the last attempt.
    fn probe_due(&self, connection_name: &str) -> bool {
        let interval = Duration::from_secs(self.settings.timing.health_interval_secs);
        match self.last_probe.get(connection_name) {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    async fn write_snapshot(&self, snapshot: &StatusSnapshot) -> VpnResult<()> {
        let path = &self.settings.paths.status_path;
        if let Some(parent) = path.parent() {
            persist::ensure_directory_exists(parent).await?;
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        persist::write_atomic(path, &content, persist::MODE_PUBLIC).await?;
        debug!(
            "Published status for {} connection(s)",
            snapshot.connections.len()
        );
        Ok(())
    }
}
