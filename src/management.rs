//! Management endpoints the gateway answers itself
//!
//! Runner registration and lookup, the routed app list and a system summary.
//! Per-app operations are not handled here; they are forwarded to runners.

use crate::cluster::{Cluster, Runner};
use crate::dispatch::{Route, RouteKind};
use crate::error::{GatewayError, NOT_FOUND_MESSAGE};
use crate::proxy::Gateway;
use crate::reconcile::reconcile_runner;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted registration form
const MAX_FORM_BYTES: usize = 64 * 1024;

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn json_response(status: StatusCode, body: impl Serialize) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_vec(&body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .expect("valid response builder")
}

#[derive(Serialize)]
struct AppEntry {
    name: String,
    url: String,
}

#[derive(Serialize)]
struct AppList {
    apps: Vec<AppEntry>,
}

#[derive(Serialize)]
struct RunnerList {
    runners: Vec<Runner>,
}

#[derive(Serialize)]
struct SystemInfo {
    name: &'static str,
    version: &'static str,
    runners: usize,
    routes: usize,
    proxied_requests: u64,
    failed_requests: u64,
}

/// Answer a gateway-local management request
pub async fn handle(
    req: Request<Incoming>,
    route: &Route,
    gateway: &Gateway,
    client_origin: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let method = req.method().clone();
    debug!(method = %method, path = %req.uri().path(), "Management request");

    let result = match (route.kind, &method) {
        (RouteKind::ListApps, _) => Ok(list_apps(gateway, client_origin)),
        (RouteKind::ListRunners, _) => Ok(list_runners(gateway)),
        (RouteKind::RegisterRunner, _) => register_runner(req, gateway, client_origin).await,
        (RouteKind::RunnerItem, &Method::DELETE) => delete_runner(gateway, route.capture()).await,
        (RouteKind::RunnerItem, _) => get_runner(gateway, route.capture()),
        (RouteKind::System, _) => Ok(system_info(gateway)),
        _ => Err(GatewayError::NotFound(NOT_FOUND_MESSAGE.to_string())),
    };

    result.unwrap_or_else(|e| {
        if let GatewayError::Persistence { .. } = e {
            warn!(error = %e, "Registry update failed");
        }
        e.to_json_response()
    })
}

/// Routed apps sorted by name, with client-facing URLs
fn list_apps(gateway: &Gateway, client_origin: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut names: Vec<String> = gateway.routes().all().into_keys().collect();
    names.sort();
    let apps = names
        .into_iter()
        .map(|name| AppEntry {
            url: format!("{}/{}", client_origin, name),
            name,
        })
        .collect();
    json_response(StatusCode::OK, AppList { apps })
}

fn list_runners(gateway: &Gateway) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        StatusCode::OK,
        RunnerList {
            runners: gateway.cluster().list(),
        },
    )
}

fn get_runner(gateway: &Gateway, id: &str) -> Result<Response<BoxBody<Bytes, hyper::Error>>, GatewayError> {
    gateway
        .cluster()
        .get(id)
        .map(|runner| json_response(StatusCode::OK, runner))
        .ok_or_else(|| GatewayError::NotFound(format!("No runner found with ID {}", id)))
}

async fn delete_runner(gateway: &Gateway, id: &str) -> Result<Response<BoxBody<Bytes, hyper::Error>>, GatewayError> {
    let id = id.to_string();
    let runner = update_registry(gateway.cluster(), move |cluster| cluster.deregister(&id)).await?;
    info!(runner = %runner.id, "Runner deregistered");
    Ok(json_response(StatusCode::OK, runner))
}

async fn register_runner(
    req: Request<Incoming>,
    gateway: &Gateway,
    client_origin: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, GatewayError> {
    let body = Limited::new(req.into_body(), MAX_FORM_BYTES)
        .collect()
        .await
        .map_err(|e| GatewayError::Validation(format!("Could not read registration form: {}", e)))?
        .to_bytes();

    let form = parse_form(&body);
    let id = form.get("id").cloned().unwrap_or_default();
    let url = form.get("url").cloned().unwrap_or_default();
    let max_apps = parse_max_apps(form.get("maxApps").map(String::as_str))?;

    let runner = update_registry(gateway.cluster(), move |cluster| cluster.register(&id, &url, max_apps)).await?;
    info!(runner = %runner.id, url = %runner.url, max_apps = runner.max_apps, "Runner registered");

    if let Err(e) = reconcile_runner(&runner, gateway.routes(), gateway.lister()).await {
        warn!(runner = %runner.id, error = %e, "Could not load apps from new runner");
    }

    let mut response = json_response(StatusCode::CREATED, &runner);
    if let Ok(location) = format!("{}/api/v1/runners/{}", client_origin, runner.id).parse() {
        response.headers_mut().insert(LOCATION, location);
    }
    Ok(response)
}

/// Run a registry mutation on the blocking pool
async fn update_registry<F>(cluster: &Arc<Cluster>, update: F) -> Result<Runner, GatewayError>
where
    F: FnOnce(&Cluster) -> Result<Runner, GatewayError> + Send + 'static,
{
    let cluster = Arc::clone(cluster);
    let path = cluster.path().to_path_buf();
    tokio::task::spawn_blocking(move || update(&cluster))
        .await
        .map_err(|e| GatewayError::Persistence {
            path,
            source: std::io::Error::other(e),
        })?
}

fn system_info(gateway: &Gateway) -> Response<BoxBody<Bytes, hyper::Error>> {
    let stats = gateway.pool().stats();
    json_response(
        StatusCode::OK,
        SystemInfo {
            name: PKG_NAME,
            version: VERSION,
            runners: gateway.cluster().len(),
            routes: gateway.routes().len(),
            proxied_requests: stats.get_total_requests(),
            failed_requests: stats.get_failed_requests(),
        },
    )
}

fn parse_form(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn parse_max_apps(raw: Option<&str>) -> Result<usize, GatewayError> {
    let raw = raw.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return Err(GatewayError::Validation("No maxApps value was specified".to_string()));
    }
    raw.parse()
        .map_err(|_| GatewayError::Validation(format!("maxApps must be a positive number, got '{}'", raw)))
}
