//! HTTP accept loop and host-based dispatch to request handlers

use crate::router::SubdomainRouter;
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// A request handler shared by every connection of a server
pub type Handler =
    Arc<dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<ResponseBody>> + Send + Sync>;

/// Dispatch each request to the handler picked by its Host header
pub fn subdomain_handler(router: SubdomainRouter<Handler>) -> Handler {
    let router = Arc::new(router);
    Arc::new(move |req: Request<Incoming>| {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host());
        let handler = Arc::clone(router.route(host));
        debug!(host, uri = %req.uri(), "Routing request");
        handler(req)
    })
}

/// HTTP server serving a single handler
pub struct HttpServer {
    name: &'static str,
    bind_addr: SocketAddr,
    handler: Handler,
    shutdown_rx: watch::Receiver<bool>,
}

impl HttpServer {
    pub fn new(
        name: &'static str,
        bind_addr: SocketAddr,
        handler: Handler,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name,
            bind_addr,
            handler,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            anyhow::anyhow!("{} server failed to bind {}: {}", self.name, self.bind_addr, e)
        })?;
        serve(self.name, listener, self.handler, self.shutdown_rx).await
    }
}

/// Accept connections on `listener` until shutdown is signalled
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    handler: Handler,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(server = name, addr = %addr, "Server listening (HTTP/1.1 and HTTP/2)");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                debug!(server = name, addr = %peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(server = name, error = %e, "Failed to accept connection");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped sender also means shutdown
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(server = name, "Server shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn serve_connection(stream: TcpStream, handler: Handler) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let fut = handler(req);
        async move { Ok::<_, Infallible>(fut.await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
