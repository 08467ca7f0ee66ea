//! The www and admin application handlers
//!
//! Both serve static files from their own root and share one CouchDB proxy
//! mounted under `/_api`. Plugin metadata lives under `/_api/_plugins` and
//! never reaches CouchDB.

use crate::proxy::CouchProxy;
use crate::readiness::SharedDatabaseInfo;
use crate::server::{Handler, ResponseBody};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Path prefix forwarded to CouchDB
pub const API_PREFIX: &str = "/_api";

const PLUGINS_PATH: &str = "/_api/_plugins";
const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    Www,
    Admin,
}

impl AppKind {
    pub fn name(&self) -> &'static str {
        match self {
            AppKind::Www => "www",
            AppKind::Admin => "admin",
        }
    }
}

/// What a request resolves to before any I/O happens
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    /// Forward to CouchDB with this path and query
    Forward(String),
    ListPlugins,
    Plugin(String),
    /// Serve a file relative to the handler's root
    Static(PathBuf),
    NotFound,
}

#[derive(Debug, Serialize)]
struct PluginInfo<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct NotFoundBody {
    #[serde(rename = "statusCode")]
    status_code: u16,
    error: &'static str,
}

pub struct AppHandler {
    kind: AppKind,
    root: PathBuf,
    plugins: Arc<Vec<String>>,
    proxy: Arc<CouchProxy>,
    info: SharedDatabaseInfo,
}

impl AppHandler {
    pub fn new(
        kind: AppKind,
        root: impl Into<PathBuf>,
        plugins: Arc<Vec<String>>,
        proxy: Arc<CouchProxy>,
        info: SharedDatabaseInfo,
    ) -> Self {
        Self {
            kind,
            root: root.into(),
            plugins,
            proxy,
            info,
        }
    }

    pub fn kind(&self) -> AppKind {
        self.kind
    }

    pub fn into_handler(self) -> Handler {
        let app = Arc::new(self);
        Arc::new(move |req: Request<Incoming>| -> BoxFuture<'static, Response<ResponseBody>> {
            let app = Arc::clone(&app);
            Box::pin(async move { app.handle(req).await })
        })
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        debug!(
            app = self.kind.name(),
            method = %req.method(),
            path = %path_and_query,
            couch_version = ?self.info.version(),
            "Handling request"
        );

        match resolve(req.method(), &path_and_query) {
            Action::Forward(path) => self.proxy.forward_or_error(&path, req).await,
            Action::ListPlugins => {
                let plugins: Vec<PluginInfo> = self
                    .plugins
                    .iter()
                    .map(|name| PluginInfo { name })
                    .collect();
                json_response(StatusCode::OK, &plugins)
            }
            Action::Plugin(name) => match self.plugins.iter().find(|p| **p == name) {
                Some(name) => json_response(StatusCode::OK, &PluginInfo { name }),
                None => not_found(),
            },
            Action::Static(relative) => {
                let wants_html = accepts_html(&req);
                self.serve_file(&relative, wants_html).await
            }
            Action::NotFound => not_found(),
        }
    }

    async fn serve_file(&self, relative: &Path, wants_html: bool) -> Response<ResponseBody> {
        let path = self.root.join(relative);
        match tokio::fs::read(&path).await {
            Ok(contents) => file_response(&path, contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound || path.is_dir() => {
                if wants_html {
                    self.serve_index().await
                } else {
                    not_found()
                }
            }
            Err(e) => {
                warn!(app = self.kind.name(), path = %path.display(), error = %e, "Failed to read static file");
                not_found()
            }
        }
    }

    async fn serve_index(&self) -> Response<ResponseBody> {
        let index = self.root.join(INDEX_FILE);
        match tokio::fs::read(&index).await {
            Ok(contents) => file_response(&index, contents),
            Err(_) => not_found(),
        }
    }
}

fn resolve(method: &Method, path_and_query: &str) -> Action {
    let path = path_and_query.split('?').next().unwrap_or("/");

    if path == PLUGINS_PATH || path == "/_api/_plugins/" {
        return Action::ListPlugins;
    }
    if let Some(name) = path.strip_prefix("/_api/_plugins/") {
        let name = name.trim_end_matches('/');
        return if name.is_empty() || name.contains('/') {
            Action::NotFound
        } else {
            Action::Plugin(name.to_string())
        };
    }

    if path == API_PREFIX || path.starts_with("/_api/") {
        let rest = &path_and_query[API_PREFIX.len()..];
        let forwarded = if rest.is_empty() || rest.starts_with('?') {
            format!("/{}", rest)
        } else {
            rest.to_string()
        };
        return Action::Forward(forwarded);
    }

    if *method != Method::GET && *method != Method::HEAD {
        return Action::NotFound;
    }

    match static_path(path) {
        Some(relative) => Action::Static(relative),
        None => Action::NotFound,
    }
}

/// Relative file path for a URL path, rejecting traversal
fn static_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." || segment == "." || segment.contains('\\') {
            return None;
        }
        relative.push(segment);
    }
    if relative.as_os_str().is_empty() {
        relative.push(INDEX_FILE);
    }
    Some(relative)
}

fn accepts_html<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

fn file_response(path: &Path, contents: Vec<u8>) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type(path))
        .body(full_body(contents))
        .expect("valid response builder")
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response builder")
}

fn not_found() -> Response<ResponseBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &NotFoundBody {
            status_code: 404,
            error: "Not Found",
        },
    )
}
