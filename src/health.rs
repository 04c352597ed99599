//! Active health probing.
//!
//! Each upstream group with a non-empty probe path owns one prober task.
//! The prober ticks on the configured interval, probes every host in the
//! group concurrently with the configured per-request timeout, and toggles
//! each host's availability flag. A status in `[200,399]` marks the host
//! available; any other status, connection error, or timeout marks it
//! unavailable.
//!
//! Probers run on a dedicated runtime owned by the process, so they are
//! independent of the request worker runtimes and survive for the lifetime
//! of their group. Cancellation is cooperative through the token stored
//! alongside the group.

use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::Client;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proxy::upstream::{HealthCheck, Host, UpstreamGroup};

/// Spawns probers onto the probe runtime. Cheap to clone; one per process,
/// handed to every group through the routing table.
#[derive(Clone)]
pub struct ProbeRunner {
    handle: Handle,
    client: Client,
}

impl ProbeRunner {
    pub fn new(handle: Handle, client: Client) -> Self {
        Self { handle, client }
    }

    /// Starts a prober for `group` with the parameters captured in `check`.
    /// The returned token cancels it; the task also exits on its own once
    /// the group has been dropped.
    pub fn spawn(&self, group: Weak<UpstreamGroup>, check: HealthCheck) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let client = self.client.clone();
        self.handle.spawn(async move {
            run_probe_loop(client, group, check, task_token).await;
        });
        token
    }
}

async fn run_probe_loop(
    client: Client,
    group: Weak<UpstreamGroup>,
    check: HealthCheck,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(check.interval.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let hosts = match group.upgrade() {
            Some(group) => group.host_handles(),
            None => break,
        };
        let probes = hosts.iter().map(|host| probe_host(&client, host, &check));
        futures_util::future::join_all(probes).await;
    }
}

/// Probes one host and records the verdict in its availability flag.
async fn probe_host(client: &Client, host: &Arc<Host>, check: &HealthCheck) {
    let available = match probe(client, host, check).await {
        Ok(status) => (200..400).contains(&status),
        Err(err) => {
            debug!(server = %host.server, error = %err, "probe failed");
            false
        }
    };
    if available != host.is_available() {
        info!(
            server = %host.server,
            name = %host.name,
            available,
            "host availability changed"
        );
    }
    host.set_available(available);
}

async fn probe(client: &Client, host: &Arc<Host>, check: &HealthCheck) -> Result<u16, reqwest::Error> {
    let url = format!("{}{}", host.server.trim_end_matches('/'), check.path);
    let method = reqwest::Method::from_bytes(check.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let response = client
        .request(method, &url)
        .timeout(Duration::from_secs(check.timeout.max(1)))
        .send()
        .await?;
    Ok(response.status().as_u16())
}

/// A probe runner backed by a shared runtime, for unit tests.
#[cfg(test)]
pub(crate) fn test_runner() -> ProbeRunner {
    use std::sync::OnceLock;
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    let rt = RT.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("probe test runtime")
    });
    ProbeRunner::new(rt.handle().clone(), Client::new())
}
