//! Coordinated shutdown of the supervised CouchDB process
//!
//! The host process must not exit while CouchDB is still running, otherwise
//! the database is orphaned. Every exit path goes through
//! [`ShutdownCoordinator::teardown`], which stops CouchDB and waits (bounded)
//! for it to exit.

use crate::process::{ProcessSupervisor, StopOutcome};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Extra time allowed on top of the grace period for SIGKILL and reaping
const TEARDOWN_MARGIN: Duration = Duration::from_secs(10);

/// Exit code used after an interrupt
pub const INTERRUPT_EXIT_CODE: i32 = 0;

#[derive(Debug)]
pub struct ShutdownCoordinator {
    supervisor: Arc<ProcessSupervisor>,
    installed: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            installed: AtomicBool::new(false),
        })
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Install the SIGINT/SIGTERM hook. Returns false if it was already
    /// installed.
    ///
    /// Call this as soon as CouchDB has been spawned, before waiting for it
    /// to become ready, so a signal at any point stops CouchDB first.
    pub fn install(self: &Arc<Self>) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let code = coordinator.on_signal(interrupt_signal()).await;
            std::process::exit(code);
        });

        true
    }

    /// Wait for `signal`, then take the interrupt path and return its exit code
    pub async fn on_signal<F>(&self, signal: F) -> i32
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.interrupt().await
    }

    /// Stop CouchDB and wait for it to exit.
    ///
    /// Returns `None` if CouchDB did not stop within the bounded wait; the
    /// caller may exit anyway.
    pub async fn teardown(&self) -> Option<StopOutcome> {
        let limit = self.supervisor.config().shutdown_grace_period + TEARDOWN_MARGIN;
        match tokio::time::timeout(limit, self.supervisor.stop()).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!(
                    timeout_secs = limit.as_secs(),
                    pid = self.supervisor.pid(),
                    "CouchDB did not stop in time, exiting anyway"
                );
                None
            }
        }
    }

    /// Interrupt path: stop CouchDB, then report the exit code to use
    pub async fn interrupt(&self) -> i32 {
        self.teardown().await;
        INTERRUPT_EXIT_CODE
    }

    /// Normal exit path: stop CouchDB, then exit with `code`
    pub async fn exit(&self, code: i32) -> ! {
        self.teardown().await;
        info!(code, "Exiting");
        std::process::exit(code)
    }
}

/// Resolves on Ctrl+C or SIGTERM. A listener that cannot be installed
/// never resolves.
async fn interrupt_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT (Ctrl+C), stopping CouchDB first"),
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, stopping CouchDB first");
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
