//! Forwarding of HTTP requests to CouchDB
//!
//! Requests and responses are streamed through a pooled HTTP client. A
//! semaphore caps the number of concurrent upstream requests; the permit is
//! held until the response body has been fully consumed or dropped.

use crate::config::CouchConfig;
use crate::error::ProxyError;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Where CouchDB listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Target for a configured CouchDB; a remote `base_url` takes precedence
    pub fn from_config(config: &CouchConfig) -> Self {
        let remote = config
            .base_url
            .as_deref()
            .and_then(|url| url.parse::<Uri>().ok())
            .and_then(|uri| {
                let host = uri.host()?.to_string();
                Some(Self::new(host, uri.port_u16().unwrap_or(80)))
            });
        remote.unwrap_or_else(|| Self::new(config.host.clone(), config.port))
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for the CouchDB proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Maximum concurrent upstream requests
    pub max_sockets: usize,
    /// Abort the upstream request if no response arrives within this time
    pub request_timeout: Duration,
    /// Idle pooled connection timeout
    pub idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_sockets: 1024,
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ProxyConfig {
    pub fn from_config(config: &CouchConfig) -> Self {
        Self {
            max_sockets: config.max_sockets,
            request_timeout: config.request_timeout(),
            ..Self::default()
        }
    }
}

/// Forwards requests to CouchDB
pub struct CouchProxy {
    client: Client<HttpConnector, Incoming>,
    target: ProxyTarget,
    config: ProxyConfig,
    permits: Arc<Semaphore>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl CouchProxy {
    pub fn new(target: ProxyTarget, config: ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_sockets)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            target = %target.authority(),
            max_sockets = config.max_sockets,
            request_timeout_secs = config.request_timeout.as_secs(),
            "CouchDB proxy initialized"
        );

        Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_sockets)),
            target,
            config,
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Upstream requests currently holding a connection slot
    pub fn in_flight(&self) -> usize {
        self.config.max_sockets - self.permits.available_permits()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Forward `req` to CouchDB with its path and query replaced by `new_path`.
    ///
    /// Exactly one upstream request is made; failures are returned, never
    /// retried.
    pub async fn forward(
        &self,
        new_path: &str,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let upstream_req = self.rewrite(new_path, req)?;
        let timeout = self.config.request_timeout;

        let result = tokio::time::timeout(timeout, async {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| ProxyError::RequestBuild("connection limiter closed".to_string()))?;
            let response = self.client.request(upstream_req).await?;
            Ok::<_, ProxyError>((permit, response))
        })
        .await;

        match result {
            Ok(Ok((permit, response))) => {
                let (parts, body) = response.into_parts();
                // The slot is released once the body is consumed or dropped
                let body = body
                    .map_frame(move |frame| {
                        let _slot = &permit;
                        frame
                    })
                    .boxed();
                Ok(Response::from_parts(parts, body))
            }
            Ok(Err(e)) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                warn!(target = %self.target.authority(), path = new_path, error = %e, "Failed to forward request to CouchDB");
                Err(e)
            }
            Err(_) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target = %self.target.authority(),
                    path = new_path,
                    timeout_secs = timeout.as_secs(),
                    "CouchDB request timed out"
                );
                Err(ProxyError::Timeout(timeout))
            }
        }
    }

    /// Like [`forward`](Self::forward), rendering failures as JSON error responses
    pub async fn forward_or_error(
        &self,
        new_path: &str,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.forward(new_path, req).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    fn rewrite(
        &self,
        new_path: &str,
        req: Request<Incoming>,
    ) -> Result<Request<Incoming>, ProxyError> {
        let authority = self.target.authority();
        let path = if new_path.starts_with('/') {
            new_path.to_string()
        } else {
            format!("/{}", new_path)
        };
        let uri = format!("http://{}{}", authority, path)
            .parse::<Uri>()
            .map_err(|e| ProxyError::RequestBuild(e.to_string()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;

        let headers = &mut parts.headers;
        if !headers.contains_key(X_REQUEST_ID) {
            if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                headers.insert(X_REQUEST_ID, value);
            }
        }
        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        // Change origin: CouchDB sees its own address as Host
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| ProxyError::RequestBuild(e.to_string()))?;
        headers.insert(HOST, host);

        debug!(method = %parts.method, uri = %parts.uri, "Forwarding to CouchDB");
        Ok(Request::from_parts(parts, body))
    }
}
