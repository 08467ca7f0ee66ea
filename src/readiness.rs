//! Readiness polling for CouchDB
//!
//! CouchDB answers `GET /` with a welcome document such as
//! `{"couchdb":"Welcome","version":"1.6.1"}` once it accepts requests.
//! The poller probes that endpoint on a fixed interval until it answers or
//! the deadline passes.

use crate::error::StartupError;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default overall readiness deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);
/// Default delay between probes
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);
/// Upper bound for a single probe request
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of one polling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessResult {
    /// CouchDB answered with its version
    Ready { version: String },
    /// The deadline passed without a successful answer
    TimedOut {
        elapsed_ms: u64,
        log_paths: Vec<PathBuf>,
    },
}

/// Facts learned about the running database, shared with the rest of the app.
///
/// Only the readiness poller writes the version.
#[derive(Debug, Default)]
pub struct DatabaseInfo {
    version: RwLock<Option<String>>,
}

pub type SharedDatabaseInfo = Arc<DatabaseInfo>;

impl DatabaseInfo {
    pub fn new() -> SharedDatabaseInfo {
        Arc::new(Self::default())
    }

    /// Version reported by the last successful readiness poll
    pub fn version(&self) -> Option<String> {
        self.version.read().clone()
    }

    fn set_version(&self, version: &str) {
        *self.version.write() = Some(version.to_string());
    }
}

#[derive(Deserialize)]
struct Welcome {
    version: Option<serde_json::Value>,
}

/// Result of a single probe
enum Probe {
    Ready(String),
    NotReady(String),
    Invalid(String),
}

/// Polls an HTTP endpoint until it reports a version
pub struct ReadinessPoller {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
    interval: Duration,
    log_paths: Vec<PathBuf>,
    quiet: bool,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_INTERVAL)
    }
}

impl ReadinessPoller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(PROBE_REQUEST_TIMEOUT));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .build(connector);

        Self {
            client,
            timeout,
            interval,
            log_paths: Vec::new(),
            quiet: false,
        }
    }

    /// Log files to report when the deadline passes
    pub fn with_log_paths(mut self, log_paths: Vec<PathBuf>) -> Self {
        self.log_paths = log_paths;
        self
    }

    /// Demote progress messages to debug
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe `url` until it answers 200 with a version or the timeout passes.
    ///
    /// Probes are strictly sequential. Connection failures and non-200
    /// answers are both treated as "not ready yet".
    pub async fn poll(&self, url: &str) -> Result<ReadinessResult, StartupError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| StartupError::Configuration(format!("invalid CouchDB URL '{}': {}", url, e)))?;

        if self.quiet {
            debug!(%uri, "Waiting for CouchDB");
        } else {
            info!(%uri, "Waiting for CouchDB...");
        }

        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.probe(&uri).await {
                Probe::Ready(version) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    if self.quiet {
                        debug!(%version, attempts, elapsed_ms, "CouchDB is ready");
                    } else {
                        info!(%version, attempts, elapsed_ms, "CouchDB is ready");
                    }
                    return Ok(ReadinessResult::Ready { version });
                }
                Probe::Invalid(reason) => {
                    return Err(StartupError::InvalidProbeResponse {
                        url: url.to_string(),
                        reason,
                    });
                }
                Probe::NotReady(reason) => {
                    debug!(attempts, reason, "CouchDB not available yet");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                warn!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Timed out waiting for CouchDB"
                );
                return Ok(ReadinessResult::TimedOut {
                    elapsed_ms: elapsed.as_millis() as u64,
                    log_paths: self.log_paths.clone(),
                });
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Poll until ready, record the version on `info` and return it
    pub async fn wait_until_ready(
        &self,
        url: &str,
        info: &DatabaseInfo,
    ) -> Result<String, StartupError> {
        match self.poll(url).await? {
            ReadinessResult::Ready { version } => {
                info.set_version(&version);
                Ok(version)
            }
            ReadinessResult::TimedOut {
                elapsed_ms,
                log_paths,
            } => Err(StartupError::ReadinessTimeout {
                elapsed_ms,
                log_paths,
            }),
        }
    }

    async fn probe(&self, uri: &Uri) -> Probe {
        let req = match Request::builder()
            .method("GET")
            .uri(uri.clone())
            .header("Accept", "application/json")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => return Probe::Invalid(e.to_string()),
        };

        let result = tokio::time::timeout(PROBE_REQUEST_TIMEOUT, async {
            let response = self.client.request(req).await.map_err(|e| e.to_string())?;
            let status = response.status();
            if status != StatusCode::OK {
                return Ok((status, Bytes::new()));
            }
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| e.to_string())?
                .to_bytes();
            Ok::<_, String>((status, body))
        })
        .await;

        match result {
            Ok(Ok((StatusCode::OK, body))) => parse_welcome(&body),
            Ok(Ok((status, _))) => Probe::NotReady(format!("status {}", status)),
            Ok(Err(e)) => Probe::NotReady(e),
            Err(_) => Probe::NotReady("probe timed out".to_string()),
        }
    }
}

fn parse_welcome(body: &[u8]) -> Probe {
    match serde_json::from_slice::<Welcome>(body) {
        Ok(Welcome {
            version: Some(serde_json::Value::String(version)),
        }) => Probe::Ready(version),
        Ok(_) => Probe::Invalid("response has no string 'version' field".to_string()),
        Err(e) => Probe::Invalid(format!("response is not JSON: {}", e)),
    }
}

/// Errors from the `_db_updates` capability probe
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid CouchDB URL '{0}'")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("unexpected status {0} from /_db_updates")]
    UnexpectedStatus(StatusCode),
}

/// Whether the `/_db_updates` feed exists on the CouchDB at `base_url`.
///
/// Older CouchDB releases do not treat `_db_updates` as a root handler and
/// reject it with `400 Bad Request` (illegal database name); that answer
/// means "not available", not an error.
pub async fn db_updates_available(base_url: &str) -> Result<bool, ProbeError> {
    let url = format!(
        "{}/_db_updates?feed=longpoll&timeout=0",
        base_url.trim_end_matches('/')
    );
    let uri: Uri = url.parse().map_err(|_| ProbeError::InvalidUrl(url.clone()))?;

    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .header("Accept", "application/json")
        .body(Empty::<Bytes>::new())
        .map_err(|_| ProbeError::InvalidUrl(url.clone()))?;

    let response = client.request(req).await?;
    let status = response.status();

    if status == StatusCode::BAD_REQUEST {
        debug!(%base_url, "/_db_updates not supported by this CouchDB");
        return Ok(false);
    }
    if status.is_success() {
        return Ok(true);
    }
    Err(ProbeError::UnexpectedStatus(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::Response;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Serve `status`/`body` per request number (0-based) on a loopback port
    async fn spawn_server<F>(respond: F) -> (String, Arc<AtomicUsize>)
    where
        F: Fn(usize, &Request<Incoming>) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let counter = Arc::clone(&counter);
                let respond = Arc::clone(&respond);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        let (status, body) = respond(n, &req);
                        async move {
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (format!("http://{}/", addr), hits)
    }

    /// A loopback URL nothing listens on
    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_ready_after_failures() {
        let failures = 3;
        let (url, hits) = spawn_server(move |n, _| {
            if n < failures {
                (StatusCode::SERVICE_UNAVAILABLE, "starting".to_string())
            } else {
                (StatusCode::OK, r#"{"couchdb":"Welcome","version":"1.2.0"}"#.to_string())
            }
        })
        .await;

        let interval = Duration::from_millis(50);
        let poller = ReadinessPoller::new(Duration::from_secs(5), interval);
        let start = Instant::now();
        let result = poller.poll(&url).await.unwrap();

        assert_eq!(
            result,
            ReadinessResult::Ready {
                version: "1.2.0".to_string()
            }
        );
        assert!(start.elapsed() >= interval * failures as u32);
        assert_eq!(hits.load(Ordering::SeqCst), failures + 1);
    }

    #[tokio::test]
    async fn test_times_out_when_never_ready() {
        let url = refused_url().await;
        let timeout = Duration::from_millis(400);
        let interval = Duration::from_millis(50);
        let logs = vec![PathBuf::from("/data/couch.stderr")];
        let poller = ReadinessPoller::new(timeout, interval).with_log_paths(logs.clone());

        let start = Instant::now();
        let result = poller.poll(&url).await.unwrap();
        let elapsed = start.elapsed();

        match result {
            ReadinessResult::TimedOut {
                elapsed_ms,
                log_paths,
            } => {
                assert!(elapsed_ms >= timeout.as_millis() as u64);
                assert_eq!(log_paths, logs);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + interval + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_non_200_is_retried_until_timeout() {
        let (url, hits) =
            spawn_server(|_, _| (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())).await;
        let poller = ReadinessPoller::new(Duration::from_millis(300), Duration::from_millis(50));

        let result = poller.poll(&url).await.unwrap();

        assert!(matches!(result, ReadinessResult::TimedOut { .. }));
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_wait_until_ready_records_version() {
        let (url, _) = spawn_server(|_, _| {
            (StatusCode::OK, r#"{"couchdb":"Welcome","version":"1.6.1"}"#.to_string())
        })
        .await;
        let info = DatabaseInfo::new();
        assert!(info.version().is_none());

        let version = ReadinessPoller::default()
            .wait_until_ready(&url, &info)
            .await
            .unwrap();

        assert_eq!(version, "1.6.1");
        assert_eq!(info.version().as_deref(), Some("1.6.1"));
    }

    #[tokio::test]
    async fn test_wait_until_ready_timeout_error() {
        let url = refused_url().await;
        let info = DatabaseInfo::new();
        let poller = ReadinessPoller::new(Duration::from_millis(100), Duration::from_millis(20))
            .with_log_paths(vec![PathBuf::from("couch.log")]);

        let err = poller.wait_until_ready(&url, &info).await.unwrap_err();

        assert!(matches!(err, StartupError::ReadinessTimeout { .. }));
        assert!(info.version().is_none());
    }

    #[tokio::test]
    async fn test_200_without_version_is_invalid() {
        let (url, _) = spawn_server(|_, _| (StatusCode::OK, r#"{"ok":true}"#.to_string())).await;
        let err = ReadinessPoller::default().poll(&url).await.unwrap_err();
        assert!(matches!(err, StartupError::InvalidProbeResponse { .. }));
    }

    #[tokio::test]
    async fn test_db_updates_available() {
        let (url, _) = spawn_server(|_, req| {
            assert_eq!(req.uri().path(), "/_db_updates");
            (StatusCode::OK, r#"{"results":[]}"#.to_string())
        })
        .await;
        assert!(db_updates_available(&url).await.unwrap());
    }

    #[tokio::test]
    async fn test_db_updates_bad_request_means_unavailable() {
        let (url, _) = spawn_server(|_, _| {
            (
                StatusCode::BAD_REQUEST,
                r#"{"error":"illegal_database_name"}"#.to_string(),
            )
        })
        .await;
        assert!(!db_updates_available(&url).await.unwrap());
    }

    #[tokio::test]
    async fn test_db_updates_other_errors_surface() {
        let (url, _) =
            spawn_server(|_, _| (StatusCode::UNAUTHORIZED, "{}".to_string())).await;
        let err = db_updates_available(&url).await.unwrap_err();
        assert!(matches!(err, ProbeError::UnexpectedStatus(StatusCode::UNAUTHORIZED)));

        let err = db_updates_available(&refused_url().await).await.unwrap_err();
        assert!(matches!(err, ProbeError::Request(_)));
    }
}
