//! Request classification
//!
//! Every inbound request is matched against [`RULES`] in order and the first
//! rule that fits decides how it is handled. Patterns are either an exact path
//! or a prefix followed by one captured path segment.

use hyper::Method;
use url::{Position, Url};

/// What the gateway does with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// `/`: redirect to the default app
    Home,
    /// `POST /api/v1/apps`: allocate a runner and forward
    CreateApp,
    /// `GET /api/v1/apps`: list routed apps
    ListApps,
    /// `/api/v1/apps/{name}/...`: forward to the runner hosting `name`
    AppApi,
    /// `GET /api/v1/runners`
    ListRunners,
    /// `POST /api/v1/runners`
    RegisterRunner,
    /// `GET|DELETE /api/v1/runners/{id}`
    RunnerItem,
    /// `GET /api/v1/system`
    System,
    /// Anything else under `/api/`
    UnknownApi,
    /// `/{app}/...`: forward through the routing table
    AppTraffic,
}

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Exact(&'static str),
    /// Prefix plus one non-empty captured segment
    Capture(&'static str),
    Prefix(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    /// `None` matches any method
    method: Option<&'static str>,
    pattern: Pattern,
    kind: RouteKind,
}

const fn rule(method: Option<&'static str>, pattern: Pattern, kind: RouteKind) -> Rule {
    Rule { method, pattern, kind }
}

/// Routing precedence, first match wins
const RULES: &[Rule] = &[
    rule(None, Pattern::Exact("/"), RouteKind::Home),
    rule(Some("POST"), Pattern::Exact("/api/v1/apps"), RouteKind::CreateApp),
    rule(Some("GET"), Pattern::Exact("/api/v1/apps"), RouteKind::ListApps),
    rule(None, Pattern::Capture("/api/v1/apps/"), RouteKind::AppApi),
    rule(Some("GET"), Pattern::Exact("/api/v1/runners"), RouteKind::ListRunners),
    rule(Some("POST"), Pattern::Exact("/api/v1/runners"), RouteKind::RegisterRunner),
    rule(Some("GET"), Pattern::Capture("/api/v1/runners/"), RouteKind::RunnerItem),
    rule(Some("DELETE"), Pattern::Capture("/api/v1/runners/"), RouteKind::RunnerItem),
    rule(Some("GET"), Pattern::Exact("/api/v1/system"), RouteKind::System),
    rule(None, Pattern::Prefix("/api/"), RouteKind::UnknownApi),
    rule(None, Pattern::Capture("/"), RouteKind::AppTraffic),
];

/// A classified request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: RouteKind,
    /// Captured segment: app name, runner ID or app prefix
    pub capture: Option<String>,
    /// Path after the captured segment, possibly empty
    pub rest: String,
}

impl Route {
    /// Classify a request. Returns `None` when no rule applies.
    pub fn classify(method: &Method, path: &str) -> Option<Route> {
        RULES.iter().find_map(|rule| {
            if rule.method.is_some_and(|m| m != method.as_str()) {
                return None;
            }
            match_pattern(rule.pattern, path).map(|(capture, rest)| Route {
                kind: rule.kind,
                capture,
                rest,
            })
        })
    }

    pub fn capture(&self) -> &str {
        self.capture.as_deref().unwrap_or("")
    }
}

fn match_pattern(pattern: Pattern, path: &str) -> Option<(Option<String>, String)> {
    match pattern {
        Pattern::Exact(p) => (path == p).then(|| (None, String::new())),
        Pattern::Prefix(p) => path.strip_prefix(p).map(|rest| (None, rest.to_string())),
        Pattern::Capture(p) => {
            let remainder = path.strip_prefix(p)?;
            let end = remainder.find('/').unwrap_or(remainder.len());
            let segment = &remainder[..end];
            if segment.is_empty() {
                return None;
            }
            Some((Some(segment.to_string()), remainder[end..].to_string()))
        }
    }
}

/// `scheme://authority` of a URL, without a trailing slash
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Runner base with the original path and query, for app creation
pub fn creation_target(runner: &Url, path: &str, query: Option<&str>) -> Url {
    let mut target = runner.clone();
    target.set_path(path);
    target.set_query(query);
    target
}

/// Stored app address followed by the remainder of the path and the query
pub fn traffic_target(stored: &Url, rest: &str, query: Option<&str>) -> String {
    let mut target = format!("{}{}", stored.as_str().trim_end_matches('/'), rest);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Backend origin with the original management path and query
pub fn management_target(backend: &Url, path: &str, query: Option<&str>) -> String {
    let mut target = format!("{}{}", origin_of(backend), path);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// True when `rest`, the text following an origin, starts at a URL boundary
/// rather than continuing the host or port.
pub fn at_origin_boundary(rest: &str) -> bool {
    match rest.chars().next() {
        None => true,
        Some(c) => matches!(c, '/' | '?' | '#' | '"' | '\\') || c.is_whitespace(),
    }
}

/// Rewrite a backend `Location` so it points at the client-facing origin.
///
/// A value is rewritten when its origin is `backend_origin`, either spelled
/// exactly or after normalization (explicit default port, host case).
pub fn rewrite_location(value: &str, backend_origin: &str, client_origin: &str) -> Option<String> {
    if let Some(rest) = value.strip_prefix(backend_origin) {
        if at_origin_boundary(rest) {
            return Some(format!("{}{}", client_origin, rest));
        }
    }

    let parsed = Url::parse(value).ok()?;
    if !parsed.has_host() || origin_of(&parsed) != backend_origin {
        return None;
    }
    Some(format!("{}{}", client_origin, &parsed[Position::BeforePath..]))
}

/// Final path segment of a `Location` value. A trailing slash yields `None`.
pub fn created_app_name(location: &str) -> Option<&str> {
    let path = location.split(['?', '#']).next().unwrap_or(location);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}
