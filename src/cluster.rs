//! Runner registry
//!
//! Holds the ordered set of runners the gateway may place apps on and keeps it
//! persisted as a JSON array at a fixed path. Every mutation rewrites the whole
//! file through a temp file and a rename, so the file on disk is always either
//! the previous or the next complete state.

use crate::error::GatewayError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use url::Url;

/// A capacity-bounded worker that hosts applications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runner {
    /// Unique runner ID
    pub id: String,
    /// Base URL of the runner's API and app traffic
    pub url: Url,
    /// Maximum number of apps this runner may host
    pub max_apps: usize,
}

impl Runner {
    /// Build a runner, validating the URL and capacity
    pub fn new(id: &str, url: &str, max_apps: usize) -> Result<Self, GatewayError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(GatewayError::Validation("No runner id was specified".to_string()));
        }
        let url = parse_runner_url(url)?;
        if max_apps < 1 {
            return Err(GatewayError::Validation(format!(
                "maxApps for runner {} must be at least 1",
                id
            )));
        }
        Ok(Self {
            id: id.to_string(),
            url,
            max_apps,
        })
    }

    /// True if `address` points at this runner (same scheme, host and port)
    pub fn hosts(&self, address: &Url) -> bool {
        self.url.origin() == address.origin()
    }
}

fn parse_runner_url(raw: &str) -> Result<Url, GatewayError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| GatewayError::Validation(format!("Invalid runner url '{}': {}", raw, e)))?;
    if url.scheme() != "http" || url.host_str().is_none() {
        return Err(GatewayError::Validation(format!(
            "Invalid runner url '{}': must be an absolute http:// URL",
            raw
        )));
    }
    Ok(url)
}

/// Ordered, persisted set of runners, unique by ID.
///
/// Reads take a snapshot under a short read lock. Writers serialize on
/// `write_lock`, persist the new state, and only then swap it in, so a failed
/// write leaves both the file and the in-memory view untouched.
pub struct Cluster {
    path: PathBuf,
    runners: RwLock<Vec<Runner>>,
    write_lock: Mutex<()>,
}

impl Cluster {
    /// Load the registry from `path`. A missing or empty file gives an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let path = path.into();
        let runners = read_runners(&path)?;
        info!(path = %path.display(), runners = runners.len(), "Loaded runner registry");
        Ok(Self {
            path,
            runners: RwLock::new(runners),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All runners in registration order
    pub fn list(&self) -> Vec<Runner> {
        self.runners.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Runner> {
        self.runners.read().iter().find(|r| r.id == id).cloned()
    }

    /// The first registered runner, if any
    pub fn first(&self) -> Option<Runner> {
        self.runners.read().first().cloned()
    }

    pub fn len(&self) -> usize {
        self.runners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.read().is_empty()
    }

    /// Insert or replace the runner with this ID. A replaced runner keeps its position.
    pub fn register(&self, id: &str, url: &str, max_apps: usize) -> Result<Runner, GatewayError> {
        let runner = Runner::new(id, url, max_apps)?;

        let _guard = self.write_lock.lock();
        let mut next = self.list();
        match next.iter_mut().find(|r| r.id == runner.id) {
            Some(existing) => *existing = runner.clone(),
            None => next.push(runner.clone()),
        }
        self.commit(next)?;

        info!(id = %runner.id, url = %runner.url, max_apps = runner.max_apps, "Registered runner");
        Ok(runner)
    }

    /// Remove the runner with this ID
    pub fn deregister(&self, id: &str) -> Result<Runner, GatewayError> {
        let _guard = self.write_lock.lock();
        let mut next = self.list();
        let pos = next
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| GatewayError::NotFound(format!("No runner found with ID {}", id)))?;
        let removed = next.remove(pos);
        self.commit(next)?;

        info!(id = %removed.id, url = %removed.url, "Deregistered runner");
        Ok(removed)
    }

    /// Persist `next` and swap it in. Caller must hold `write_lock`.
    fn commit(&self, next: Vec<Runner>) -> Result<(), GatewayError> {
        write_runners(&self.path, &next)?;
        *self.runners.write() = next;
        Ok(())
    }
}

fn read_runners(path: &Path) -> Result<Vec<Runner>, GatewayError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No registry file, starting empty");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(GatewayError::Persistence {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let runners: Vec<Runner> = serde_json::from_str(&content).map_err(|e| GatewayError::Persistence {
        path: path.to_path_buf(),
        source: e.into(),
    })?;

    let mut seen = std::collections::HashSet::new();
    for runner in &runners {
        if runner.max_apps < 1 {
            return Err(GatewayError::Validation(format!(
                "Runner {} in {} has maxApps 0",
                runner.id,
                path.display()
            )));
        }
        if !seen.insert(runner.id.as_str()) {
            return Err(GatewayError::Validation(format!(
                "Runner {} appears more than once in {}",
                runner.id,
                path.display()
            )));
        }
    }
    Ok(runners)
}

fn write_runners(path: &Path, runners: &[Runner]) -> Result<(), GatewayError> {
    let to_err = |source: std::io::Error| GatewayError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(to_err)?;
        }
    }

    let content = serde_json::to_string_pretty(runners).map_err(|e| to_err(e.into()))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path).map_err(to_err)?;
    file.write_all(content.as_bytes()).map_err(to_err)?;
    file.sync_all().map_err(to_err)?;
    drop(file);
    fs::rename(&tmp_path, path).map_err(to_err)?;

    debug!(path = %path.display(), runners = runners.len(), "Saved runner registry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cluster_in(dir: &TempDir) -> Cluster {
        Cluster::load(dir.path().join("cluster.json")).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty_registry() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);
        assert!(cluster.is_empty());
        assert!(cluster.first().is_none());
    }

    #[test]
    fn test_empty_file_is_empty_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, "  \n").unwrap();

        let cluster = Cluster::load(&path).unwrap();
        assert_eq!(cluster.len(), 0);
    }

    #[test]
    fn test_register_keeps_registration_order() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);

        cluster.register("runner-b", "http://10.0.0.2:8080", 2).unwrap();
        cluster.register("runner-a", "http://10.0.0.1:8080", 1).unwrap();

        let ids: Vec<_> = cluster.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["runner-b", "runner-a"]);
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);

        cluster.register("r1", "http://10.0.0.1:8080", 1).unwrap();
        cluster.register("r2", "http://10.0.0.2:8080", 1).unwrap();
        cluster.register("r1", "http://10.0.0.9:8080", 4).unwrap();

        let runners = cluster.list();
        assert_eq!(runners.len(), 2);
        assert_eq!(runners[0].id, "r1");
        assert_eq!(runners[0].url.as_str(), "http://10.0.0.9:8080/");
        assert_eq!(runners[0].max_apps, 4);
    }

    #[test]
    fn test_register_same_runner_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);

        let first = cluster.register("r1", "http://10.0.0.1:8080", 2).unwrap();
        let second = cluster.register("r1", "http://10.0.0.1:8080", 2).unwrap();

        assert_eq!(first, second);
        assert_eq!(cluster.list(), vec![first]);
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);

        for (id, url, max_apps) in [
            ("r1", "not a url", 1),
            ("r1", "/relative/path", 1),
            ("r1", "ftp://10.0.0.1/", 1),
            ("r1", "http://10.0.0.1:8080", 0),
            ("  ", "http://10.0.0.1:8080", 1),
        ] {
            let err = cluster.register(id, url, max_apps).unwrap_err();
            assert!(matches!(err, GatewayError::Validation(_)), "{:?}", err);
        }
        assert!(cluster.is_empty());
        assert!(!cluster.path().exists());
    }

    #[test]
    fn test_deregister_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);

        let err = cluster.deregister("ghost").unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_mutations_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("cluster.json");
        let cluster = Cluster::load(&path).unwrap();

        cluster.register("r1", "http://10.0.0.1:8080", 1).unwrap();
        cluster.register("r2", "http://10.0.0.2:8080", 3).unwrap();
        cluster.register("r3", "http://10.0.0.3:8080", 2).unwrap();
        cluster.deregister("r2").unwrap();
        cluster.register("r1", "http://10.0.0.1:9090", 5).unwrap();

        let reloaded = Cluster::load(&path).unwrap();
        assert_eq!(reloaded.list(), cluster.list());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_persisted_format_uses_max_apps_key() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);
        cluster.register("r1", "http://10.0.0.1:8080", 2).unwrap();

        let raw = fs::read_to_string(cluster.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[0]["id"], "r1");
        assert_eq!(value[0]["url"], "http://10.0.0.1:8080/");
        assert_eq!(value[0]["maxApps"], 2);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            Cluster::load(&path),
            Err(GatewayError::Persistence { .. })
        ));
    }

    #[test]
    fn test_failed_write_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster_in(&dir);
        cluster.register("r1", "http://10.0.0.1:8080", 1).unwrap();

        // A directory where the temp file should go makes the write fail
        fs::create_dir(cluster.path().with_extension("json.tmp")).unwrap();

        let err = cluster.register("r2", "http://10.0.0.2:8080", 1).unwrap_err();
        assert!(matches!(err, GatewayError::Persistence { .. }));
        assert_eq!(cluster.len(), 1);

        let reloaded = Cluster::load(cluster.path()).unwrap();
        assert_eq!(reloaded.list(), cluster.list());
    }

    #[test]
    fn test_hosts_compares_origin() {
        let runner = Runner::new("r1", "http://10.0.0.1:8080", 1).unwrap();
        assert!(runner.hosts(&Url::parse("http://10.0.0.1:8080/app1").unwrap()));
        assert!(!runner.hosts(&Url::parse("http://10.0.0.1:8081/app1").unwrap()));
        assert!(!runner.hosts(&Url::parse("http://10.0.0.2:8080/app1").unwrap()));
    }
}
