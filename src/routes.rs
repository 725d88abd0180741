//! Routing table: application name to backend base address

use crate::cluster::Runner;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Point-in-time copy of the routing table
pub type RouteSnapshot = HashMap<String, Url>;

/// Concurrent map from app name to the backend address serving it.
///
/// A single `RwLock` guards the whole map so `all()` is a consistent snapshot
/// rather than a shard-by-shard walk.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: RwLock<HashMap<String, Url>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Url> {
        self.entries.read().get(name).cloned()
    }

    /// Insert or overwrite the entry for `name`
    pub fn put(&self, name: &str, address: Url) {
        debug!(app = name, address = %address, "Route updated");
        self.entries.write().insert(name.to_string(), address);
    }

    /// Remove the entry for `name`, returning the old address
    pub fn remove(&self, name: &str) -> Option<Url> {
        let removed = self.entries.write().remove(name);
        if removed.is_some() {
            debug!(app = name, "Route removed");
        }
        removed
    }

    pub fn all(&self) -> RouteSnapshot {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Number of entries in `snapshot` served by `runner`
pub fn load_on(snapshot: &RouteSnapshot, runner: &Runner) -> usize {
    snapshot.values().filter(|address| runner.hosts(address)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_put_then_get() {
        let table = RoutingTable::new();
        table.put("demo", url("http://backend:9000"));
        assert_eq!(table.get("demo"), Some(url("http://backend:9000")));
        assert_eq!(table.get("other"), None);
    }

    #[test]
    fn test_put_overwrites() {
        let table = RoutingTable::new();
        table.put("demo", url("http://runner-1:8080/demo"));
        table.put("demo", url("http://runner-2:8080/demo"));
        assert_eq!(table.get("demo"), Some(url("http://runner-2:8080/demo")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_then_get() {
        let table = RoutingTable::new();
        table.put("demo", url("http://backend:9000"));
        assert!(table.remove("demo").is_some());
        assert_eq!(table.get("demo"), None);
        assert!(table.remove("demo").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let table = RoutingTable::new();
        table.put("a", url("http://backend:1/a"));
        let snapshot = table.all();
        table.put("b", url("http://backend:1/b"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.all().len(), 2);
    }

    #[test]
    fn test_load_on_counts_by_origin() {
        let runner = Runner::new("r1", "http://10.0.0.1:8080", 3).unwrap();
        let table = RoutingTable::new();
        table.put("a", url("http://10.0.0.1:8080/a"));
        table.put("b", url("http://10.0.0.1:8080/b"));
        table.put("c", url("http://10.0.0.2:8080/c"));

        assert_eq!(load_on(&table.all(), &runner), 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let table = Arc::new(RoutingTable::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let name = format!("app-{}", i);
                table.put(&name, url(&format!("http://backend:9000/{}", name)));
                assert!(table.get(&name).is_some());
                let _ = table.all();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(table.len(), 32);
    }
}
