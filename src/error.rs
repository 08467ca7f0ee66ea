//! Error types and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort the CouchDB startup sequence.
///
/// None of these are retried; the caller restarts the whole sequence.
#[derive(Debug, Error)]
pub enum StartupError {
    /// A required setting is missing; raised before anything is spawned
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failed to prepare the storage directory or derived ini file
    #[error("Failed to prepare CouchDB storage at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The CouchDB process failed before it was running
    #[error("Failed to start CouchDB ({executable}): {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// CouchDB never answered the readiness probe
    #[error(
        "Timed out waiting for CouchDB after {elapsed_ms}ms. These logs may help:\n{}",
        format_log_paths(.log_paths)
    )]
    ReadinessTimeout {
        elapsed_ms: u64,
        log_paths: Vec<PathBuf>,
    },

    /// CouchDB answered 200 but the body carried no version
    #[error("Unexpected response from CouchDB at {url}: {reason}")]
    InvalidProbeResponse { url: String, reason: String },

    /// A version string could not be parsed
    #[error("Invalid CouchDB version '{0}'")]
    InvalidVersion(String),

    /// CouchDB is older than the minimum supported version
    #[error(
        "The version of CouchDB you are using ({found}) is out of date.\n\
         Please update to CouchDB {minimum} or later."
    )]
    IncompatibleVersion { found: String, minimum: String },
}

fn format_log_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("\t{}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failure while forwarding a single request to CouchDB.
///
/// Scoped to one request; other in-flight requests are unaffected.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Could not connect to or read from CouchDB
    #[error("Upstream connection failed: {0}")]
    Connection(#[from] hyper_util::client::legacy::Error),

    /// CouchDB did not respond within the request timeout
    #[error("Upstream request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The rewritten request was invalid
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::Connection(_) => ProxyErrorCode::ConnectionFailed,
            ProxyError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            ProxyError::RequestBuild(_) => ProxyErrorCode::InternalError,
        }
    }

    /// Render as a JSON error response; details stay in the logs
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let message = match &self {
            ProxyError::Connection(_) => "Failed to connect to CouchDB".to_string(),
            ProxyError::Timeout(timeout) => {
                format!("Request timed out after {} seconds", timeout.as_secs())
            }
            ProxyError::RequestBuild(_) => "Invalid proxied request".to_string(),
        };
        json_error_response(self.code(), message)
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request timed out waiting for CouchDB
    RequestTimeout,
    /// Failed to connect to CouchDB
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
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
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
