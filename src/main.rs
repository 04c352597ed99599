//! mgw: a dynamically-configurable HTTP microgateway.
//!
//! One listener serves both planes: requests under `/mgw` administer the
//! routing table (register, delete, save, load, inspect) and everything
//! else is matched against it and relayed to an available backend. The
//! table is persisted to an embedded store and restored on startup, and
//! every upstream group is actively health-probed in the background.

mod admin;
mod config;
mod error;
mod health;
mod listeners;
mod proxy;
mod store;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::services::background::background_service;
use pingora_proxy::http_proxy_service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, CONFIG_FILE};
use crate::health::ProbeRunner;
use crate::proxy::Gateway;
use crate::store::{ApiStore, FlushOnShutdown, RouteTable};

/// Directory of the embedded store.
const DB_DIR: &str = "db";

fn main() -> Result<()> {
    let conf = Config::load(CONFIG_FILE).context("failed to load config")?;
    init_tracing(conf.debug);
    tracing::info!(listen = %conf.listen.address(), debug = conf.debug, "mgw starting");

    // Probers live on their own runtime so group lifecycle is independent
    // of the request worker runtimes.
    let probe_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("mgw-probe")
        .enable_all()
        .build()
        .context("failed to create probe runtime")?;
    let probes = ProbeRunner::new(probe_rt.handle().clone(), reqwest::Client::new());

    let table = Arc::new(RouteTable::new(probes));
    let store = Arc::new(ApiStore::open(Path::new(DB_DIR)).context("failed to open store")?);
    match store.load(&table) {
        Ok(restored) => tracing::info!(restored, "routing table restored"),
        Err(err) => tracing::warn!(error = %err, "routing table restore failed"),
    }

    let addr = listeners::parse_network_address(&conf.listen.address())
        .context("invalid listen address")?;

    let mut server = Server::new(Some(Opt::default())).context("failed to create server")?;
    server.bootstrap();

    let gateway = Gateway::new(table.clone(), store.clone(), &conf);
    let mut proxy_service = http_proxy_service(&server.configuration, gateway);
    if addr.is_unix() {
        proxy_service.add_uds(&addr.host, None);
    } else {
        proxy_service.add_tcp(&addr.bind_addr());
    }
    tracing::info!(addr = %addr.bind_addr(), "gateway listening");

    let flush = background_service("table-flush", FlushOnShutdown::new(table, store));

    server.add_service(proxy_service);
    server.add_service(flush);
    server.run_forever();
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "mgw=debug,info" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}
