use couchgate::app::{AppHandler, AppKind};
use couchgate::config::Config;
use couchgate::proxy::{CouchProxy, ProxyConfig, ProxyTarget};
use couchgate::readiness::{DatabaseInfo, SharedDatabaseInfo};
use couchgate::router::{SubdomainRouter, ADMIN_PREFIX};
use couchgate::server::{subdomain_handler, HttpServer};
use couchgate::startup::start_database;
use couchgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("couchgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("couchgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Shutdown hooks are installed as soon as CouchDB is spawned
    let info = DatabaseInfo::new();
    let coordinator = match start_database(&config.couch, &info).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let code = match run_servers(&config, info, coordinator.is_none()).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Server error");
            1
        }
    };

    match coordinator {
        Some(coordinator) => coordinator.exit(code).await,
        None if code != 0 => std::process::exit(code),
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

/// Serve until a signal arrives. With a supervised CouchDB the shutdown
/// coordinator owns SIGINT and SIGTERM and exits the process itself.
async fn run_servers(
    config: &Config,
    info: SharedDatabaseInfo,
    handle_signals: bool,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = Arc::new(CouchProxy::new(
        ProxyTarget::from_config(&config.couch),
        ProxyConfig::from_config(&config.couch),
    ));
    let plugins = Arc::new(config.server.plugins.clone());

    let www = AppHandler::new(
        AppKind::Www,
        &config.server.www_root,
        Arc::clone(&plugins),
        Arc::clone(&proxy),
        Arc::clone(&info),
    )
    .into_handler();
    let admin = AppHandler::new(
        AppKind::Admin,
        &config.server.admin_root,
        plugins,
        proxy,
        info,
    )
    .into_handler();

    let host = &config.server.host;
    let www_addr = bind_addr(host, config.server.www_port)?;
    let admin_addr = bind_addr(host, config.server.admin_port)?;
    let mut handles = vec![
        spawn_server(HttpServer::new(
            "www",
            www_addr,
            Arc::clone(&www),
            shutdown_rx.clone(),
        )),
        spawn_server(HttpServer::new(
            "admin",
            admin_addr,
            Arc::clone(&admin),
            shutdown_rx.clone(),
        )),
    ];

    if config.server.run_router {
        let router = SubdomainRouter::new(www).with_route(ADMIN_PREFIX, admin);
        handles.push(spawn_server(HttpServer::new(
            "router",
            bind_addr(host, config.server.router_port)?,
            subdomain_handler(router),
            shutdown_rx.clone(),
        )));
    }

    if handle_signals {
        wait_for_signal().await?;
    } else {
        std::future::pending::<()>().await;
    }

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    Ok(())
}

fn spawn_server(server: HttpServer) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Server error");
        }
    })
}

fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port).parse().map_err(|e| {
        error!(host, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", host, port, e)
    })
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = ctrl_c => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting application servers");
    info!(
        host = %config.server.host,
        www_port = config.server.www_port,
        admin_port = config.server.admin_port,
        router_port = if config.server.run_router { Some(config.server.router_port) } else { None },
        "Server configuration"
    );
    info!(
        www_root = %config.server.www_root,
        admin_root = %config.server.admin_root,
        plugins = ?config.server.plugins,
        "Application settings"
    );
    info!(
        run = config.couch.run,
        url = %config.couch.base_url(),
        storage = %config.couch.storage_prefix,
        minimum_version = %config.couch.minimum_version,
        "CouchDB settings"
    );
    info!(
        max_sockets = config.couch.max_sockets,
        request_timeout_secs = config.couch.request_timeout_secs,
        shutdown_grace_period_secs = config.couch.shutdown_grace_period_secs,
        "Proxy and shutdown settings"
    );
}
