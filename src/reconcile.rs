//! Routing table reconciliation against the live cluster
//!
//! Each runner is asked which apps it hosts, and every reported app is routed
//! to that runner. A runner that cannot be queried is logged and skipped; the
//! table simply starts sparser and fills in as creations are observed.

use crate::cluster::{Cluster, Runner};
use crate::error::GatewayError;
use crate::routes::RoutingTable;
use futures::future::{join_all, BoxFuture};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Path on each runner that lists its hosted apps
pub const RUNNER_APPS_PATH: &str = "/api/v1/apps";

/// Source of truth for which apps a runner currently hosts
pub trait AppLister: Send + Sync {
    fn list_apps<'a>(&'a self, runner: &'a Runner) -> BoxFuture<'a, Result<Vec<String>, GatewayError>>;
}

#[derive(Debug, Deserialize)]
struct AppList {
    #[serde(default)]
    apps: Vec<AppSummary>,
}

#[derive(Debug, Deserialize)]
struct AppSummary {
    name: String,
}

/// Queries runners over HTTP
pub struct RunnerClient {
    http_client: reqwest::Client,
}

impl RunnerClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client })
    }

    async fn fetch(&self, runner: &Runner) -> Result<Vec<String>, GatewayError> {
        let query_err = |reason: String| GatewayError::ReconciliationQuery {
            runner: runner.id.clone(),
            reason,
        };

        let url = runner
            .url
            .join(RUNNER_APPS_PATH)
            .map_err(|e| query_err(e.to_string()))?;

        let list: AppList = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| query_err(e.to_string()))?
            .json()
            .await
            .map_err(|e| query_err(format!("malformed app list: {}", e)))?;

        Ok(list.apps.into_iter().map(|app| app.name).collect())
    }
}

impl AppLister for RunnerClient {
    fn list_apps<'a>(&'a self, runner: &'a Runner) -> BoxFuture<'a, Result<Vec<String>, GatewayError>> {
        Box::pin(self.fetch(runner))
    }
}

/// Outcome of a reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub runners_queried: usize,
    pub runners_failed: usize,
    pub routes_written: usize,
}

/// Address under which `runner` serves the app called `name`. Names that are
/// not a single path segment give `None`.
pub fn app_address(runner_url: &Url, name: &str) -> Option<Url> {
    if name.is_empty() || name.contains(['/', '?', '#', '\\']) {
        return None;
    }
    runner_url.join(&format!("/{}", name)).ok()
}

/// Query every runner and route each reported app to the runner hosting it.
///
/// Runners are queried concurrently; results are applied in registration order
/// so an app reported by two runners ends up on the later one.
pub async fn reconcile(
    cluster: &Cluster,
    routes: &RoutingTable,
    lister: &dyn AppLister,
) -> ReconcileReport {
    let runners = cluster.list();
    let results = join_all(runners.iter().map(|runner| lister.list_apps(runner))).await;

    let mut report = ReconcileReport::default();
    for (runner, result) in runners.iter().zip(results) {
        report.runners_queried += 1;
        match result {
            Ok(apps) => report.routes_written += apply(runner, apps, routes),
            Err(e) => {
                report.runners_failed += 1;
                warn!(runner = %runner.id, url = %runner.url, error = %e, "Skipping runner during reconciliation");
            }
        }
    }

    info!(
        runners = report.runners_queried,
        failed = report.runners_failed,
        routes = report.routes_written,
        "Reconciled routing table"
    );
    report
}

/// Reconcile a single runner, e.g. right after it is registered
pub async fn reconcile_runner(
    runner: &Runner,
    routes: &RoutingTable,
    lister: &dyn AppLister,
) -> Result<usize, GatewayError> {
    let apps = lister.list_apps(runner).await?;
    let written = apply(runner, apps, routes);
    info!(runner = %runner.id, routes = written, "Loaded apps from runner");
    Ok(written)
}

fn apply(runner: &Runner, apps: Vec<String>, routes: &RoutingTable) -> usize {
    let mut written = 0;
    for name in apps {
        match app_address(&runner.url, &name) {
            Some(address) => {
                routes.put(&name, address);
                written += 1;
            }
            None => warn!(runner = %runner.id, app = %name, "Ignoring app with unroutable name"),
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Lister backed by a fixed map; runners not in the map fail
    struct FakeLister {
        apps: HashMap<String, Vec<String>>,
    }

    impl FakeLister {
        fn new(entries: &[(&str, Vec<&str>)]) -> Self {
            Self {
                apps: entries
                    .iter()
                    .map(|(id, apps)| (id.to_string(), apps.iter().map(|a| a.to_string()).collect()))
                    .collect(),
            }
        }
    }

    impl AppLister for FakeLister {
        fn list_apps<'a>(&'a self, runner: &'a Runner) -> BoxFuture<'a, Result<Vec<String>, GatewayError>> {
            let result = self.apps.get(&runner.id).cloned().ok_or_else(|| {
                GatewayError::ReconciliationQuery {
                    runner: runner.id.clone(),
                    reason: "connection refused".to_string(),
                }
            });
            Box::pin(async move { result })
        }
    }

    fn cluster(dir: &TempDir, runners: &[(&str, &str)]) -> Cluster {
        let cluster = Cluster::load(dir.path().join("cluster.json")).unwrap();
        for (id, url) in runners {
            cluster.register(id, url, 10).unwrap();
        }
        cluster
    }

    #[tokio::test]
    async fn test_reconcile_routes_every_reported_app() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, &[("r1", "http://10.0.0.1:8080"), ("r2", "http://10.0.0.2:8080")]);
        let lister = FakeLister::new(&[("r1", vec!["app1", "app2"]), ("r2", vec!["app3"])]);
        let routes = RoutingTable::new();

        let report = reconcile(&cluster, &routes, &lister).await;

        assert_eq!(report.routes_written, 3);
        assert_eq!(report.runners_failed, 0);
        assert_eq!(routes.get("app1").unwrap().as_str(), "http://10.0.0.1:8080/app1");
        assert_eq!(routes.get("app3").unwrap().as_str(), "http://10.0.0.2:8080/app3");
    }

    #[tokio::test]
    async fn test_failing_runner_is_skipped() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(
            &dir,
            &[
                ("down", "http://10.0.0.9:8080"),
                ("r1", "http://10.0.0.1:8080"),
            ],
        );
        let lister = FakeLister::new(&[("r1", vec!["app1"])]);
        let routes = RoutingTable::new();

        let report = reconcile(&cluster, &routes, &lister).await;

        assert_eq!(
            report,
            ReconcileReport {
                runners_queried: 2,
                runners_failed: 1,
                routes_written: 1
            }
        );
        assert!(routes.get("app1").is_some());
    }

    #[tokio::test]
    async fn test_total_failure_leaves_table_empty() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, &[("r1", "http://10.0.0.1:8080")]);
        let routes = RoutingTable::new();

        let report = reconcile(&cluster, &routes, &FakeLister::new(&[])).await;

        assert_eq!(report.runners_failed, 1);
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn test_later_runner_wins_duplicate_app() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, &[("r1", "http://10.0.0.1:8080"), ("r2", "http://10.0.0.2:8080")]);
        let lister = FakeLister::new(&[("r1", vec!["dup"]), ("r2", vec!["dup"])]);
        let routes = RoutingTable::new();

        reconcile(&cluster, &routes, &lister).await;

        assert_eq!(routes.get("dup").unwrap().as_str(), "http://10.0.0.2:8080/dup");
    }

    #[tokio::test]
    async fn test_reconcile_single_runner() {
        let runner = Runner::new("r1", "http://10.0.0.1:8080", 2).unwrap();
        let routes = RoutingTable::new();

        let written = reconcile_runner(&runner, &routes, &FakeLister::new(&[("r1", vec!["a"])]))
            .await
            .unwrap();
        assert_eq!(written, 1);

        let err = reconcile_runner(&runner, &routes, &FakeLister::new(&[])).await.unwrap_err();
        assert!(matches!(err, GatewayError::ReconciliationQuery { .. }));
    }

    #[test]
    fn test_app_address_resolves_from_root() {
        let base = Url::parse("http://10.0.0.1:8080/some/base/").unwrap();
        assert_eq!(app_address(&base, "demo").unwrap().as_str(), "http://10.0.0.1:8080/demo");
    }

    #[test]
    fn test_app_address_rejects_multi_segment_names() {
        let base = Url::parse("http://10.0.0.1:8080").unwrap();
        for name in ["", "/evil.example", "a/b", "a?b", "a#b", "\\evil.example"] {
            assert_eq!(app_address(&base, name), None, "{name}");
        }
    }

    #[tokio::test]
    async fn test_unroutable_names_are_skipped() {
        let dir = TempDir::new().unwrap();
        let cluster = cluster(&dir, &[("r1", "http://10.0.0.1:8080")]);
        let lister = FakeLister::new(&[("r1", vec!["good", "/evil.example", "nested/app"])]);
        let routes = RoutingTable::new();

        let report = reconcile(&cluster, &routes, &lister).await;

        assert_eq!(report.routes_written, 1);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes.get("good").unwrap().as_str(), "http://10.0.0.1:8080/good");
        assert!(routes.get("/evil.example").is_none());
    }

    #[test]
    fn test_parse_app_list() {
        let list: AppList = serde_json::from_str(
            r#"{"apps":[{"name":"app1","url":"http://x/app1"},{"name":"app2"}]}"#,
        )
        .unwrap();
        let names: Vec<_> = list.apps.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["app1", "app2"]);
    }
}
