//! The gateway's public listener
//!
//! Every request is classified by [`Route::classify`], then either answered
//! locally or forwarded to the runner that owns it. Responses from runners have
//! their `Location` header rewritten to the gateway's own origin, and app
//! creation, redeploy and deletion replies update the routing table.

use crate::allocator::{Allocator, Reservation};
use crate::capture::BodySink;
use crate::cluster::Cluster;
use crate::config::ServerConfig;
use crate::dispatch::{
    created_app_name, creation_target, management_target, origin_of, rewrite_location,
    traffic_target, Route, RouteKind,
};
use crate::error::{text_error_response, GatewayError, ProxyErrorCode};
use crate::management;
use crate::pool::{parse_target, ConnectionPool};
use crate::reconcile::{app_address, AppLister};
use crate::routes::RoutingTable;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST, LOCATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// State shared by every connection
pub struct Gateway {
    cluster: Arc<Cluster>,
    routes: Arc<RoutingTable>,
    allocator: Allocator,
    pool: ConnectionPool,
    lister: Arc<dyn AppLister>,
    default_app: Option<String>,
    request_timeout: Option<Duration>,
}

impl Gateway {
    pub fn new(
        cluster: Arc<Cluster>,
        routes: Arc<RoutingTable>,
        lister: Arc<dyn AppLister>,
        server: &ServerConfig,
    ) -> Self {
        Self {
            allocator: Allocator::new(Arc::clone(&cluster), Arc::clone(&routes)),
            pool: ConnectionPool::new(server.pool_config()),
            cluster,
            routes,
            lister,
            default_app: server.default_app().map(String::from),
            request_timeout: server.request_timeout(),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn lister(&self) -> &dyn AppLister {
        self.lister.as_ref()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
        grace: Duration,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            grace,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled, then
    /// let open connections drain for at most the grace period.
    pub async fn run_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let graceful = GracefulShutdown::new();
        let builder = AutoBuilder::new(TokioExecutor::new());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let local = stream.local_addr().unwrap_or(addr);
                            let gateway = Arc::clone(&self.gateway);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let gateway = Arc::clone(&gateway);
                                async move { handle_request(req, gateway, peer, local).await }
                            });

                            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn.into_owned());
                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => info!("All connections drained"),
            _ = tokio::time::sleep(self.grace) => {
                warn!(grace_secs = self.grace.as_secs(), "Grace period elapsed with connections still open");
            }
        }

        Ok(())
    }
}

/// A resolved forwarding target
struct Target {
    uri: String,
    /// Runner or app address the request is sent to
    backend: Url,
    /// Capacity held on the runner until the creation reply is handled
    reservation: Option<Reservation>,
}

async fn handle_request(
    mut req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let client_origin = client_origin(&req, local_addr);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(String::from);

    debug!(method = %method, path, request_id, "Incoming request");

    let route = match Route::classify(&method, &path) {
        Some(route) => route,
        None => return Ok(GatewayError::RouteNotFound.to_text_response()),
    };

    let target = match route.kind {
        RouteKind::Home => return Ok(home(gateway.default_app.as_deref(), &client_origin)),
        RouteKind::ListApps
        | RouteKind::ListRunners
        | RouteKind::RegisterRunner
        | RouteKind::RunnerItem
        | RouteKind::System => {
            return Ok(management::handle(req, &route, &gateway, &client_origin).await);
        }
        RouteKind::UnknownApi => return Ok(GatewayError::RouteNotFound.to_text_response()),
        RouteKind::CreateApp => create_target(&gateway, &path, query.as_deref()),
        RouteKind::AppApi => app_api_target(&gateway, route.capture(), &path, query.as_deref()),
        RouteKind::AppTraffic => traffic(&gateway, &route, query.as_deref()),
    };

    let Target {
        uri,
        backend,
        reservation,
    } = match target {
        Ok(target) => target,
        Err(e) => {
            debug!(method = %method, path, request_id, error = %e, "No target for request");
            return Ok(e.to_text_response());
        }
    };

    let sink = BodySink::for_request(route.kind, req.headers());
    set_forwarding_headers(&mut req, &request_id, client_addr, &client_origin);

    info!(method = %method, path, request_id, target = %uri, "Proxying request");

    let mut response = match forward(&gateway, req, &uri).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                GatewayError::BackendTimeout { .. } => warn!(request_id, target = %uri, error = %e, "Backend timed out"),
                _ => error!(request_id, target = %uri, error = %e, "Failed to forward request"),
            }
            return Ok(e.to_text_response());
        }
    };

    let backend_origin = origin_of(&backend);
    record_route_changes(&gateway, &route, &method, &response, &backend);
    drop(reservation);

    rewrite_response_location(&mut response, &backend_origin, &client_origin);

    match sink.finish(response, &backend_origin, &client_origin).await {
        Ok(response) => Ok(response),
        Err(e) => {
            let e = GatewayError::BackendUnreachable {
                target: uri,
                reason: e.to_string(),
            };
            error!(request_id, error = %e, "Failed to read backend reply");
            Ok(e.to_text_response())
        }
    }
}

fn create_target(gateway: &Gateway, path: &str, query: Option<&str>) -> Result<Target, GatewayError> {
    let reservation = gateway
        .allocator
        .reserve()
        .ok_or(GatewayError::CapacityExhausted)?;
    let backend = reservation.runner().url.clone();
    let uri = creation_target(&backend, path, query).to_string();
    Ok(Target {
        uri,
        backend,
        reservation: Some(reservation),
    })
}

/// Per-app management goes to the runner hosting the app, or to the first
/// runner when the app is not routed yet.
fn app_api_target(
    gateway: &Gateway,
    name: &str,
    path: &str,
    query: Option<&str>,
) -> Result<Target, GatewayError> {
    let backend = match gateway.routes.get(name) {
        Some(address) => address,
        None => gateway
            .cluster
            .first()
            .map(|runner| runner.url)
            .ok_or_else(|| {
                GatewayError::NotFound(format!("No App Runner instance can serve app {}", name))
            })?,
    };
    Ok(Target {
        uri: management_target(&backend, path, query),
        backend,
        reservation: None,
    })
}

fn traffic(gateway: &Gateway, route: &Route, query: Option<&str>) -> Result<Target, GatewayError> {
    let stored = gateway
        .routes
        .get(route.capture())
        .ok_or(GatewayError::RouteNotFound)?;
    Ok(Target {
        uri: traffic_target(&stored, &route.rest, query),
        backend: stored,
        reservation: None,
    })
}

async fn forward(
    gateway: &Gateway,
    req: Request<Incoming>,
    target: &str,
) -> Result<Response<Incoming>, GatewayError> {
    let unreachable = |reason: String| GatewayError::BackendUnreachable {
        target: target.to_string(),
        reason,
    };

    let uri = parse_target(target).map_err(|e| unreachable(e.to_string()))?;
    let send = gateway.pool.send_request(req, uri);

    let result = match gateway.request_timeout {
        Some(limit) => tokio::time::timeout(limit, send)
            .await
            .map_err(|_| GatewayError::BackendTimeout {
                target: target.to_string(),
                after: limit,
            })?,
        None => send.await,
    };

    result.map_err(|e| unreachable(e.to_string()))
}

/// Apply the routing table side effects of a backend reply
fn record_route_changes(
    gateway: &Gateway,
    route: &Route,
    method: &Method,
    response: &Response<Incoming>,
    backend: &Url,
) {
    let status = response.status();
    match route.kind {
        RouteKind::CreateApp if status == StatusCode::CREATED => {
            let name = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(created_app_name);
            match name.and_then(|name| app_address(backend, name).map(|a| (name, a))) {
                Some((name, address)) => {
                    info!(app = name, address = %address, "App created");
                    gateway.routes.put(name, address);
                }
                None => warn!(backend = %backend, "Creation reply had no usable Location header"),
            }
        }
        RouteKind::AppApi if status.is_success() => {
            let name = route.capture();
            if *method == Method::DELETE && route.rest.is_empty() {
                info!(app = name, "App deleted");
                gateway.routes.remove(name);
            } else if *method == Method::POST && route.rest == "/deploy" {
                if let Some(address) = app_address(backend, name) {
                    info!(app = name, address = %address, "App redeployed");
                    gateway.routes.put(name, address);
                }
            }
        }
        _ => {}
    }
}

fn rewrite_response_location<B>(response: &mut Response<B>, backend_origin: &str, client_origin: &str) {
    let rewritten = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| rewrite_location(v, backend_origin, client_origin))
        .and_then(|v| HeaderValue::from_str(&v).ok());

    if let Some(value) = rewritten {
        response.headers_mut().insert(LOCATION, value);
    }
}

/// Overwrite the X-Forwarded-* headers and make sure a Host header is present
fn set_forwarding_headers(
    req: &mut Request<Incoming>,
    request_id: &str,
    client_addr: SocketAddr,
    client_origin: &str,
) {
    let authority = req.uri().authority().map(|a| a.to_string());
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    // HTTP/2 clients send :authority instead of Host
    if !headers.contains_key(HOST) {
        let host = authority.unwrap_or_else(|| client_origin.trim_start_matches("http://").to_string());
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(HOST, value);
        }
    }

    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// `http://` plus the host the client used to reach the gateway
fn client_origin<B>(req: &Request<B>, local_addr: SocketAddr) -> String {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_else(|| local_addr.to_string());
    format!("http://{}", host)
}

fn home(default_app: Option<&str>, client_origin: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    match default_app {
        Some(app) => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, format!("{}/{}", client_origin, app))
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"),
        None => text_error_response(
            ProxyErrorCode::RouteNotFound,
            "You can set a default app by setting the server.default_app_name property.",
        ),
    }
}
