//! Thread-safe routing table using DashMap.
//!
//! Maps route patterns to upstream groups. Dispatch and admin handlers
//! share one table; readers see consistent per-key snapshots while writers
//! mutate other keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::GatewayError;
use crate::health::ProbeRunner;
use crate::proxy::upstream::{HealthCheck, UpstreamGroup};

/// Mapping from route pattern to upstream group; the source of truth for
/// dispatch.
pub struct RouteTable {
    groups: DashMap<String, Arc<UpstreamGroup>>,
    /// Registration counter; groups keep their number for wildcard
    /// tie-breaks.
    next_seq: AtomicU64,
    probes: ProbeRunner,
}

impl RouteTable {
    /// Creates an empty table. Groups created through it spawn their
    /// probers via `probes`.
    pub fn new(probes: ProbeRunner) -> Self {
        Self {
            groups: DashMap::new(),
            next_seq: AtomicU64::new(0),
            probes,
        }
    }

    /// Registers `(server, name)` under `pattern`, creating the group on
    /// first sight. An active `check` (non-empty path) replaces the group's
    /// health-check configuration. Returns the group.
    pub fn get_or_create(
        &self,
        pattern: &str,
        server: &str,
        name: &str,
        check: &HealthCheck,
    ) -> Result<Arc<UpstreamGroup>, GatewayError> {
        let group = self
            .groups
            .entry(pattern.to_string())
            .or_insert_with(|| {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                Arc::new(UpstreamGroup::new(pattern, seq, self.probes.clone()))
            })
            .clone();
        group.add_host(server, name)?;
        if check.is_active() && group.health_check() != *check {
            group.set_health_check(check.clone());
        }
        Ok(group)
    }

    /// Looks up the group registered under an exact pattern.
    pub fn get(&self, pattern: &str) -> Option<Arc<UpstreamGroup>> {
        self.groups.get(pattern).map(|entry| entry.value().clone())
    }

    /// Removes the group for `pattern` and stops its prober. Returns true
    /// if a group was present.
    pub fn delete(&self, pattern: &str) -> bool {
        match self.groups.remove(pattern) {
            Some((_, group)) => {
                group.stop_prober();
                true
            }
            None => false,
        }
    }

    /// Removes every host with the given server origin across all groups,
    /// discarding groups left empty. Returns how many hosts were removed.
    pub fn delete_host(&self, server: &str) -> usize {
        let mut removed = 0;
        self.groups.retain(|_, group| {
            let before = group.host_count();
            let after = group.del_host(server);
            removed += before - after;
            if after == 0 {
                group.stop_prober();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Iterates all `(pattern, group)` pairs; stops early when `f` returns
    /// false. Safe under concurrent mutation — each visited entry is a
    /// consistent snapshot.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<UpstreamGroup>) -> bool,
    {
        for entry in self.groups.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::test_runner;

    fn make_table() -> RouteTable {
        RouteTable::new(test_runner())
    }

    fn passive() -> HealthCheck {
        HealthCheck::default()
    }

    // ========== Phase 1: Registration ==========

    #[test]
    fn test_new_table_empty() {
        let table = make_table();
        assert!(table.is_empty());
        assert!(table.get("/x").is_none());
    }

    #[test]
    fn test_get_or_create_makes_group_with_host() {
        let table = make_table();
        let group = table
            .get_or_create("/x", "http://a:1", "a", &passive())
            .unwrap();
        assert_eq!(group.pattern(), "/x");
        assert_eq!(group.host_count(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_get_or_create_reuses_existing_group() {
        let table = make_table();
        table.get_or_create("/x", "http://a:1", "a", &passive()).unwrap();
        let group = table
            .get_or_create("/x", "http://b:2", "b", &passive())
            .unwrap();
        assert_eq!(group.host_count(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_get_or_create_same_registration_is_idempotent() {
        let table = make_table();
        table.get_or_create("/x", "http://a:1", "a", &passive()).unwrap();
        table.get_or_create("/x", "http://a:1", "a", &passive()).unwrap();
        assert_eq!(table.get("/x").unwrap().host_count(), 1);
    }

    #[test]
    fn test_get_or_create_active_check_replaces_config() {
        let table = make_table();
        table.get_or_create("/x", "http://a:1", "a", &passive()).unwrap();
        let check = HealthCheck::new("HEAD", "/ping", 7, 3);
        let group = table.get_or_create("/x", "http://b:2", "b", &check).unwrap();
        assert_eq!(group.health_check(), check);
    }

    #[test]
    fn test_get_or_create_passive_check_keeps_config() {
        let table = make_table();
        let check = HealthCheck::new("GET", "/ping", 7, 3);
        table.get_or_create("/x", "http://a:1", "a", &check).unwrap();
        table.get_or_create("/x", "http://b:2", "b", &passive()).unwrap();
        assert_eq!(table.get("/x").unwrap().health_check(), check);
    }

    #[test]
    fn test_groups_get_increasing_seq() {
        let table = make_table();
        let a = table.get_or_create("/a", "http://a:1", "a", &passive()).unwrap();
        let b = table.get_or_create("/b", "http://b:2", "b", &passive()).unwrap();
        assert!(a.seq() < b.seq());
    }

    // ========== Phase 2: Deletion ==========

    #[test]
    fn test_delete_removes_group() {
        let table = make_table();
        table.get_or_create("/x", "http://a:1", "a", &passive()).unwrap();
        assert!(table.delete("/x"));
        assert!(table.get("/x").is_none());
        assert!(!table.delete("/x"));
    }

    #[test]
    fn test_delete_stops_prober() {
        let table = make_table();
        let check = HealthCheck::new("GET", "/h", 30, 30);
        let group = table.get_or_create("/x", "http://a:1", "a", &check).unwrap();
        assert!(group.prober_running());
        table.delete("/x");
        assert!(!group.prober_running());
    }

    #[test]
    fn test_delete_host_across_groups() {
        let table = make_table();
        table.get_or_create("/x", "http://a:1", "a", &passive()).unwrap();
        table.get_or_create("/x", "http://b:2", "b", &passive()).unwrap();
        table.get_or_create("/y", "http://a:1", "a", &passive()).unwrap();

        let removed = table.delete_host("http://a:1");
        assert_eq!(removed, 2);
        // /y had only that host, so the group is gone.
        assert!(table.get("/y").is_none());
        // /x keeps its other host.
        assert_eq!(table.get("/x").unwrap().host_count(), 1);
    }

    #[test]
    fn test_delete_host_unknown_server_changes_nothing() {
        let table = make_table();
        table.get_or_create("/x", "http://a:1", "a", &passive()).unwrap();
        assert_eq!(table.delete_host("http://zzz:9"), 0);
        assert_eq!(table.len(), 1);
    }

    // ========== Phase 3: Range ==========

    #[test]
    fn test_range_visits_every_entry() {
        let table = make_table();
        table.get_or_create("/a", "http://a:1", "a", &passive()).unwrap();
        table.get_or_create("/b", "http://b:2", "b", &passive()).unwrap();

        let mut seen = Vec::new();
        table.range(|pattern, _| {
            seen.push(pattern.to_string());
            true
        });
        seen.sort();
        assert_eq!(seen, vec!["/a", "/b"]);
    }

    #[test]
    fn test_range_stops_when_told() {
        let table = make_table();
        table.get_or_create("/a", "http://a:1", "a", &passive()).unwrap();
        table.get_or_create("/b", "http://b:2", "b", &passive()).unwrap();

        let mut count = 0;
        table.range(|_, _| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    // ========== Phase 4: Concurrency ==========

    #[test]
    fn test_concurrent_registration_and_dispatch() {
        use std::thread;

        let table = Arc::new(make_table());
        let mut handles = vec![];

        for i in 0..8 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for n in 0..100 {
                    let pattern = format!("/svc{}/*", n % 10);
                    let server = format!("http://backend{i}:80");
                    let _ = table.get_or_create(&pattern, &server, &server, &HealthCheck::default());
                    if let Some(group) = table.get(&pattern) {
                        let _ = group.pick();
                    }
                    let mut total = 0;
                    table.range(|_, group| {
                        total += group.host_count();
                        true
                    });
                    assert!(total > 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 10);
    }

    #[test]
    fn test_table_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RouteTable>();
    }
}
