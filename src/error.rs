//! Error taxonomy and HTTP error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Body returned when no runner has a free slot for a new app
pub const NO_CAPACITY_MESSAGE: &str = "There are no App Runner instances with free capacity";

/// Body returned when a request matches no route
pub const NOT_FOUND_MESSAGE: &str = "404 Not Found";

/// Error codes echoed in the X-Proxy-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Malformed management input
    InvalidInput,
    /// Unknown runner or application
    NotFound,
    /// Every runner is at capacity
    NoCapacity,
    /// No routing table entry for the request path
    RouteNotFound,
    /// Failed to connect to the backend
    ConnectionFailed,
    /// Backend did not answer in time
    RequestTimeout,
    /// A runner could not be queried during reconciliation
    RunnerQueryFailed,
    /// Registry could not be written to disk
    PersistenceFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::RunnerQueryFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::PersistenceFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidInput => "INVALID_INPUT",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::NoCapacity => "NO_CAPACITY",
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::RunnerQueryFailed => "RUNNER_QUERY_FAILED",
            ProxyErrorCode::PersistenceFailed => "PERSISTENCE_FAILED",
        }
    }
}

/// Errors raised by the registry, allocator, reconciler and proxy
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{}", NO_CAPACITY_MESSAGE)]
    CapacityExhausted,

    #[error("{}", NOT_FOUND_MESSAGE)]
    RouteNotFound,

    #[error("Failed to connect to backend {target}: {reason}")]
    BackendUnreachable { target: String, reason: String },

    #[error("Request to {target} timed out after {} seconds", .after.as_secs())]
    BackendTimeout { target: String, after: Duration },

    #[error("Could not query runner {runner}: {reason}")]
    ReconciliationQuery { runner: String, reason: String },

    #[error("Could not write {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            GatewayError::Validation(_) => ProxyErrorCode::InvalidInput,
            GatewayError::NotFound(_) => ProxyErrorCode::NotFound,
            GatewayError::CapacityExhausted => ProxyErrorCode::NoCapacity,
            GatewayError::RouteNotFound => ProxyErrorCode::RouteNotFound,
            GatewayError::BackendUnreachable { .. } => ProxyErrorCode::ConnectionFailed,
            GatewayError::BackendTimeout { .. } => ProxyErrorCode::RequestTimeout,
            GatewayError::ReconciliationQuery { .. } => ProxyErrorCode::RunnerQueryFailed,
            GatewayError::Persistence { .. } => ProxyErrorCode::PersistenceFailed,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }

    /// Plain-text response used when the proxy cannot compute a target
    pub fn to_text_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        text_error_response(self.code(), self.to_string())
    }

    /// JSON response used by the management endpoints
    pub fn to_json_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();
    error_response(code, "application/json", body)
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn text_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(code, "text/plain; charset=utf-8", message.into())
}

fn error_response(
    code: ProxyErrorCode,
    content_type: &'static str,
    body: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
