//! Upstream groups: the set of backend hosts registered for one route
//! pattern, plus that group's health-check configuration.
//!
//! The host list is an immutable snapshot behind an atomic pointer, so
//! request handlers and probers read it without locks; admin mutations
//! swap in a new list under a group-level lock. Availability is a per-host
//! flag written only by the group's prober.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::health::ProbeRunner;

/// One backend endpoint in an upstream group.
#[derive(Debug)]
pub struct Host {
    /// Human label; defaults to the server origin when not supplied.
    pub name: String,
    /// Absolute origin of the form `scheme://host:port`.
    pub server: String,
    available: AtomicBool,
}

impl Host {
    fn new(server: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            server: server.to_string(),
            available: AtomicBool::new(true),
        }
    }

    /// Whether the last probe judged this host healthy. Hosts start out
    /// available.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Flips the health flag; called only by the group's prober.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

/// A read-only view of one host, safe to hold without locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub server: String,
    pub available: bool,
}

/// Per-group active probe configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// HTTP verb, uppercased.
    pub method: String,
    /// Probe request path; empty means "no active probing".
    pub path: String,
    /// Seconds between probe cycles.
    pub interval: u64,
    /// Seconds before a probe is judged failed.
    pub timeout: u64,
}

pub const DEFAULT_PROBE_INTERVAL: u64 = 30;
pub const DEFAULT_PROBE_TIMEOUT: u64 = 30;

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: String::new(),
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl HealthCheck {
    /// Builds a normalized check: the method is uppercased (empty means
    /// `GET`) and the interval is clamped to at least one second.
    pub fn new(method: &str, path: &str, interval: u64, timeout: u64) -> Self {
        let method = if method.is_empty() {
            "GET".to_string()
        } else {
            method.to_ascii_uppercase()
        };
        Self {
            method,
            path: path.to_string(),
            interval: interval.max(1),
            timeout,
        }
    }

    /// True when this configuration calls for a live prober.
    pub fn is_active(&self) -> bool {
        !self.path.is_empty()
    }
}

/// The hosts registered for one route pattern.
///
/// Thread-safe: `pick` and `hosts` read atomic snapshots; `add_host`,
/// `del_host`, and `set_health_check` serialize through a group-level lock.
pub struct UpstreamGroup {
    pattern: String,
    seq: u64,
    hosts: ArcSwap<Vec<Arc<Host>>>,
    check: ArcSwap<HealthCheck>,
    cursor: AtomicUsize,
    /// Serializes mutations; never held across an await.
    lock: Mutex<()>,
    prober: Mutex<Option<CancellationToken>>,
    probes: ProbeRunner,
}

impl UpstreamGroup {
    pub fn new(pattern: &str, seq: u64, probes: ProbeRunner) -> Self {
        Self {
            pattern: pattern.to_string(),
            seq,
            hosts: ArcSwap::from_pointee(Vec::new()),
            check: ArcSwap::from_pointee(HealthCheck::default()),
            cursor: AtomicUsize::new(0),
            lock: Mutex::new(()),
            prober: Mutex::new(None),
            probes,
        }
    }

    /// The route pattern this group is registered under.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Registration sequence number; earlier groups win wildcard ties.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Appends a new host. Registering an identical `(server, name)` pair
    /// again is a no-op; reusing a name for a different server is an error.
    /// An empty name defaults to the server origin.
    pub fn add_host(self: &Arc<Self>, server: &str, name: &str) -> Result<(), GatewayError> {
        let name = if name.is_empty() { server } else { name };
        let _guard = self.lock.lock();
        let current = self.hosts.load_full();
        if let Some(existing) = current.iter().find(|h| h.name == name) {
            if existing.server == server {
                return Ok(());
            }
            return Err(GatewayError::DuplicateHost(name.to_string()));
        }
        let mut next = current.as_ref().clone();
        next.push(Arc::new(Host::new(server, name)));
        self.hosts.store(Arc::new(next));
        self.ensure_prober_locked();
        Ok(())
    }

    /// Removes every host with the given server origin and returns the new
    /// host count. Dropping the last host halts the prober; the routing
    /// table is responsible for discarding the emptied group.
    pub fn del_host(&self, server: &str) -> usize {
        let _guard = self.lock.lock();
        let current = self.hosts.load_full();
        let next: Vec<Arc<Host>> = current
            .iter()
            .filter(|h| h.server != server)
            .cloned()
            .collect();
        let count = next.len();
        self.hosts.store(Arc::new(next));
        if count == 0 {
            self.stop_prober();
        }
        count
    }

    /// Returns the next available host, round-robin. `None` when every host
    /// is unavailable (or the group is empty).
    pub fn pick(&self) -> Option<Arc<Host>> {
        let hosts = self.hosts.load();
        if hosts.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..hosts.len() {
            let host = &hosts[(start + i) % hosts.len()];
            if host.is_available() {
                return Some(host.clone());
            }
        }
        None
    }

    /// Replaces the health-check configuration, halting and restarting the
    /// prober with the new parameters in one step.
    pub fn set_health_check(self: &Arc<Self>, check: HealthCheck) {
        let _guard = self.lock.lock();
        self.check.store(Arc::new(check));
        self.stop_prober();
        self.ensure_prober_locked();
    }

    /// The current health-check configuration.
    pub fn health_check(&self) -> HealthCheck {
        self.check.load().as_ref().clone()
    }

    /// Snapshot of the host list, safe to read without locks.
    pub fn hosts(&self) -> Vec<HostInfo> {
        self.hosts
            .load()
            .iter()
            .map(|h| HostInfo {
                name: h.name.clone(),
                server: h.server.clone(),
                available: h.is_available(),
            })
            .collect()
    }

    /// Live host handles for the prober.
    pub(crate) fn host_handles(&self) -> Vec<Arc<Host>> {
        self.hosts.load().as_ref().clone()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.load().len()
    }

    /// Cancels the prober, if one is running.
    pub fn stop_prober(&self) {
        if let Some(token) = self.prober.lock().take() {
            token.cancel();
        }
    }

    /// True while a prober task is attached to this group.
    pub fn prober_running(&self) -> bool {
        self.prober.lock().is_some()
    }

    fn ensure_prober_locked(self: &Arc<Self>) {
        let mut slot = self.prober.lock();
        if slot.is_some() {
            return;
        }
        let check = self.health_check();
        if !check.is_active() || self.hosts.load().is_empty() {
            return;
        }
        *slot = Some(self.probes.spawn(Arc::downgrade(self), check));
    }
}

impl Drop for UpstreamGroup {
    fn drop(&mut self) {
        if let Some(token) = self.prober.lock().take() {
            token.cancel();
        }
    }
}
