//! CouchDB startup sequence: spawn, install shutdown hooks, wait for
//! readiness, check the version

use crate::config::CouchConfig;
use crate::error::StartupError;
use crate::process::ProcessSupervisor;
use crate::readiness::{DatabaseInfo, ReadinessPoller};
use crate::shutdown::ShutdownCoordinator;
use crate::version;
use std::sync::Arc;
use tracing::{info, warn};

/// Bring CouchDB up and verify it is usable.
///
/// The shutdown hooks are installed right after the spawn, so a signal
/// while waiting for readiness still stops CouchDB. A remote CouchDB
/// (`run = false`) is not spawned and gets no hooks, but is still polled
/// and version-checked.
pub async fn start_database(
    config: &CouchConfig,
    info: &DatabaseInfo,
) -> Result<Option<Arc<ShutdownCoordinator>>, StartupError> {
    let coordinator = spawn_database(config).await?;
    if let Some(coordinator) = &coordinator {
        coordinator.install();
    }
    verify_database(config, info, coordinator.as_ref()).await?;
    Ok(coordinator)
}

/// Spawn CouchDB unless it is remote; no hooks are installed yet
pub async fn spawn_database(
    config: &CouchConfig,
) -> Result<Option<Arc<ShutdownCoordinator>>, StartupError> {
    let supervisor = ProcessSupervisor::start(config).await?;
    Ok(supervisor.map(ShutdownCoordinator::new))
}

/// Wait for readiness and check the version.
///
/// On failure a spawned CouchDB is stopped before the error is returned.
pub async fn verify_database(
    config: &CouchConfig,
    info: &DatabaseInfo,
    coordinator: Option<&Arc<ShutdownCoordinator>>,
) -> Result<String, StartupError> {
    match wait_and_check(config, info).await {
        Ok(found) => {
            info!(
                url = %config.display_url(),
                version = %found,
                "CouchDB started: {}",
                config.display_url()
            );
            Ok(found)
        }
        Err(e) => {
            if let Some(coordinator) = coordinator {
                warn!(
                    pid = coordinator.supervisor().pid(),
                    "CouchDB startup failed, stopping process"
                );
                coordinator.teardown().await;
            }
            Err(e)
        }
    }
}

async fn wait_and_check(config: &CouchConfig, info: &DatabaseInfo) -> Result<String, StartupError> {
    let poller = ReadinessPoller::new(config.ready_timeout(), config.ready_interval())
        .with_log_paths(config.log_paths())
        .with_quiet(config.quiet);

    let found = poller.wait_until_ready(&config.base_url(), info).await?;
    version::check(&found, &config.minimum_version)?;
    Ok(found)
}
