//! Durable routing-table persistence.
//!
//! The whole table is serialized as one JSON document under the `apis`
//! column family, key `apis`, in an embedded RocksDB store: a map from
//! route pattern to an array of host records with single-letter field
//! names. One record per (pattern, host) pair; loading replays each record
//! as a registration. The blob is a full snapshot, not a log.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::proxy::upstream::{
    HealthCheck, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT,
};
use crate::store::RouteTable;

const CF_APIS: &str = "apis";
const KEY_APIS: &[u8] = b"apis";

/// One persisted (pattern, host) pair. `i` and `t` are carried as decimal
/// strings; unparseable values fall back to the defaults on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostRecord {
    #[serde(rename = "h")]
    pub name: String,
    #[serde(rename = "s")]
    pub server: String,
    #[serde(rename = "m", default)]
    pub method: String,
    #[serde(rename = "p", default)]
    pub path: String,
    #[serde(rename = "i", default)]
    pub interval: String,
    #[serde(rename = "t", default)]
    pub timeout: String,
}

impl HostRecord {
    fn from_group(name: &str, server: &str, check: &HealthCheck) -> Self {
        Self {
            name: name.to_string(),
            server: server.to_string(),
            method: check.method.clone(),
            path: check.path.clone(),
            interval: check.interval.to_string(),
            timeout: check.timeout.to_string(),
        }
    }

    fn health_check(&self) -> HealthCheck {
        let interval = self.interval.parse().unwrap_or(DEFAULT_PROBE_INTERVAL);
        let timeout = self.timeout.parse().unwrap_or(DEFAULT_PROBE_TIMEOUT);
        HealthCheck::new(&self.method, &self.path, interval, timeout)
    }
}

type ApiBlob = BTreeMap<String, Vec<HostRecord>>;

/// The embedded store holding the persisted routing table.
pub struct ApiStore {
    db: DB,
}

impl ApiStore {
    /// Opens (or creates) the store at `path` with the `apis` column
    /// family present.
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, path, [CF_APIS])?;
        Ok(Self { db })
    }

    /// Serializes a point-in-time snapshot of `table` and writes it as one
    /// atomic value.
    pub fn save(&self, table: &RouteTable) -> Result<(), GatewayError> {
        let mut blob = ApiBlob::new();
        table.range(|pattern, group| {
            let check = group.health_check();
            let records = group
                .hosts()
                .iter()
                .map(|host| HostRecord::from_group(&host.name, &host.server, &check))
                .collect();
            blob.insert(pattern.to_string(), records);
            true
        });
        let data = serde_json::to_vec(&blob)
            .map_err(|err| GatewayError::Store(err.to_string()))?;
        let cf = self
            .db
            .cf_handle(CF_APIS)
            .ok_or_else(|| GatewayError::Store(format!("missing column family {CF_APIS}")))?;
        self.db.put_cf(cf, KEY_APIS, data)?;
        Ok(())
    }

    /// Reads the blob and replays every record into `table` as a
    /// registration. Returns the number of records restored. A missing
    /// blob restores nothing.
    pub fn load(&self, table: &RouteTable) -> Result<usize, GatewayError> {
        let cf = self
            .db
            .cf_handle(CF_APIS)
            .ok_or_else(|| GatewayError::Store(format!("missing column family {CF_APIS}")))?;
        let Some(raw) = self.db.get_cf(cf, KEY_APIS)? else {
            return Ok(0);
        };
        let blob: ApiBlob = serde_json::from_slice(&raw)
            .map_err(|err| GatewayError::Store(err.to_string()))?;
        let mut restored = 0;
        for (pattern, records) in blob {
            for record in records {
                let check = record.health_check();
                match table.get_or_create(&pattern, &record.server, &record.name, &check) {
                    Ok(_) => restored += 1,
                    Err(err) => {
                        warn!(pattern = %pattern, server = %record.server, error = %err, "skipping persisted record");
                    }
                }
            }
        }
        Ok(restored)
    }

    /// Forces buffered writes to disk; called once on shutdown.
    pub fn flush(&self) {
        if let Err(err) = self.db.flush() {
            warn!(error = %err, "store flush failed");
        }
    }
}

/// Background service that saves the routing table when the server begins
/// shutting down, then flushes the store.
pub struct FlushOnShutdown {
    table: Arc<RouteTable>,
    store: Arc<ApiStore>,
}

impl FlushOnShutdown {
    pub fn new(table: Arc<RouteTable>, store: Arc<ApiStore>) -> Self {
        Self { table, store }
    }
}

#[async_trait]
impl BackgroundService for FlushOnShutdown {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let _ = shutdown.changed().await;
        match self.store.save(&self.table) {
            Ok(()) => info!("routing table saved on shutdown"),
            Err(err) => warn!(error = %err, "shutdown save failed"),
        }
        self.store.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::test_runner;

    fn make_table() -> RouteTable {
        RouteTable::new(test_runner())
    }

    fn table_snapshot(table: &RouteTable) -> Vec<(String, Vec<(String, String)>, HealthCheck)> {
        let mut out = Vec::new();
        table.range(|pattern, group| {
            let hosts = group
                .hosts()
                .iter()
                .map(|h| (h.name.clone(), h.server.clone()))
                .collect();
            out.push((pattern.to_string(), hosts, group.health_check()));
            true
        });
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn test_load_from_empty_store_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiStore::open(dir.path()).unwrap();
        let table = make_table();
        assert_eq!(store.load(&table).unwrap(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiStore::open(dir.path()).unwrap();

        let table = make_table();
        let check = HealthCheck::new("HEAD", "/ping", 5, 2);
        table.get_or_create("/api/users/*", "http://a:1", "a", &check).unwrap();
        table.get_or_create("/api/users/*", "http://b:2", "b", &check).unwrap();
        table
            .get_or_create("/api/orders", "http://c:3", "c", &HealthCheck::default())
            .unwrap();
        store.save(&table).unwrap();

        let restored = make_table();
        assert_eq!(store.load(&restored).unwrap(), 3);
        assert_eq!(table_snapshot(&restored), table_snapshot(&table));
    }

    #[test]
    fn test_reload_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ApiStore::open(dir.path()).unwrap();
            let table = make_table();
            let check = HealthCheck::new("GET", "/h", 9, 4);
            table.get_or_create("/x", "http://a:1", "a", &check).unwrap();
            store.save(&table).unwrap();
            store.flush();
        }
        // A fresh process sees the same table.
        let store = ApiStore::open(dir.path()).unwrap();
        let table = make_table();
        assert_eq!(store.load(&table).unwrap(), 1);
        let group = table.get("/x").unwrap();
        assert_eq!(group.hosts()[0].server, "http://a:1");
        assert_eq!(group.health_check(), HealthCheck::new("GET", "/h", 9, 4));
    }

    #[test]
    fn test_save_overwrites_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiStore::open(dir.path()).unwrap();

        let table = make_table();
        table.get_or_create("/old", "http://a:1", "a", &HealthCheck::default()).unwrap();
        store.save(&table).unwrap();

        table.delete("/old");
        table.get_or_create("/new", "http://b:2", "b", &HealthCheck::default()).unwrap();
        store.save(&table).unwrap();

        let restored = make_table();
        store.load(&restored).unwrap();
        assert!(restored.get("/old").is_none());
        assert!(restored.get("/new").is_some());
    }

    #[test]
    fn test_missing_numeric_fields_parse_to_defaults() {
        let record: HostRecord = serde_json::from_str(
            r#"{"h":"a","s":"http://a:1","m":"GET","p":"/h"}"#,
        )
        .unwrap();
        let check = record.health_check();
        assert_eq!(check.interval, 30);
        assert_eq!(check.timeout, 30);
    }

    #[test]
    fn test_garbled_numeric_fields_parse_to_defaults() {
        let record: HostRecord = serde_json::from_str(
            r#"{"h":"a","s":"http://a:1","m":"GET","p":"/h","i":"soon","t":""}"#,
        )
        .unwrap();
        let check = record.health_check();
        assert_eq!(check.interval, 30);
        assert_eq!(check.timeout, 30);
    }

    #[test]
    fn test_record_wire_format_uses_single_letter_fields() {
        let record = HostRecord::from_group("a", "http://a:1", &HealthCheck::new("GET", "/h", 5, 2));
        let json = serde_json::to_value(&record).unwrap();
        let obj = json.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["h", "i", "m", "p", "s", "t"]);
        assert_eq!(obj["i"], "5");
        assert_eq!(obj["t"], "2");
    }
}
