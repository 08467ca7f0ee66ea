use crate::config::CouchConfig;
use crate::error::StartupError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// CouchDB session cookie lifetime (2 days)
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 2);

/// How long to wait for the process to die after SIGKILL
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// State of the managed CouchDB process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Process is not running
    Stopped,
    /// Process is being spawned
    Starting,
    /// Process was spawned and has not exited
    Running,
    /// Process failed to start or exited on its own
    Failed,
}

impl ProcessState {
    fn is_finished(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// This call terminated the process
    Stopped,
    /// The process was already stopped, or another caller stopped it
    AlreadyStopped,
}

/// Settings the CouchDB process is started with, derived once from [`CouchConfig`]
#[derive(Debug, Clone)]
pub struct ManagedProcessConfig {
    pub port: u16,
    pub host: String,
    pub storage_prefix: PathBuf,
    pub executable: PathBuf,
    pub default_ini: PathBuf,
    pub session_timeout: Duration,
    /// Always false: restarting is the caller's job, otherwise a respawn
    /// races with shutdown on Ctrl+C
    pub respawn: bool,
    pub shutdown_grace_period: Duration,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// CouchDB runs inside the storage prefix, so relative paths are resolved
/// against our own working directory first
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

impl ManagedProcessConfig {
    pub fn from_config(config: &CouchConfig) -> Result<Self, StartupError> {
        let executable = non_empty(config.executable.as_deref())
            .ok_or_else(|| StartupError::Configuration("No CouchDB binary found".to_string()))?;
        let default_ini = non_empty(config.default_ini.as_deref()).ok_or_else(|| {
            StartupError::Configuration("No CouchDB default.ini found".to_string())
        })?;

        Ok(Self {
            port: config.port,
            host: config.host.clone(),
            storage_prefix: absolute(config.storage_path()),
            executable: if executable.contains(std::path::MAIN_SEPARATOR) {
                absolute(PathBuf::from(executable))
            } else {
                PathBuf::from(executable)
            },
            default_ini: absolute(PathBuf::from(default_ini)),
            session_timeout: SESSION_TIMEOUT,
            respawn: false,
            shutdown_grace_period: config.shutdown_grace_period(),
        })
    }

    pub fn ini_path(&self) -> PathBuf {
        self.storage_prefix.join("couch.ini")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.storage_prefix.join("couch.pid")
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.storage_prefix.join("couch.stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.storage_prefix.join("couch.stderr")
    }

    pub fn log_path(&self) -> PathBuf {
        self.storage_prefix.join("couch.log")
    }

    fn data_dir(&self) -> PathBuf {
        self.storage_prefix.join("data")
    }

    /// Local ini layered over CouchDB's default.ini
    pub fn render_ini(&self) -> String {
        let data_dir = self.data_dir();
        format!(
            "[couchdb]\n\
             database_dir = {data}\n\
             view_index_dir = {data}\n\
             uri_file = {uri}\n\
             \n\
             [httpd]\n\
             port = {port}\n\
             bind_address = {host}\n\
             \n\
             [couch_httpd_auth]\n\
             timeout = {timeout}\n\
             \n\
             [log]\n\
             file = {log}\n",
            data = data_dir.display(),
            uri = self.storage_prefix.join("couch.uri").display(),
            port = self.port,
            host = self.host,
            timeout = self.session_timeout.as_secs(),
            log = self.log_path().display(),
        )
    }

    /// Arguments: reset the ini chain, then layer default.ini and our ini
    pub fn args(&self) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-a".to_string(),
            self.default_ini.display().to_string(),
            "-a".to_string(),
            self.ini_path().display().to_string(),
            "-p".to_string(),
            self.pid_path().display().to_string(),
        ]
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StartupError + '_ {
    move |source| StartupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open_log(path: &Path) -> Result<File, StartupError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error(path))
}

/// Supervises a single CouchDB process.
///
/// The child handle is owned by a monitor task; this value only holds the
/// channel used to request a stop and a receiver for state transitions.
/// Each supervisor is independent, so several databases can be run side by
/// side by constructing several supervisors.
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: ManagedProcessConfig,
    pid: Option<u32>,
    state_rx: watch::Receiver<ProcessState>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessSupervisor {
    /// Start CouchDB as described by `config`.
    ///
    /// Returns `Ok(None)` for a remote CouchDB (`run = false`): nothing is
    /// spawned and nothing is supervised.
    pub async fn start(config: &CouchConfig) -> Result<Option<Arc<Self>>, StartupError> {
        if !config.run {
            info!(url = %config.base_url(), "Using remote CouchDB");
            return Ok(None);
        }

        let managed = ManagedProcessConfig::from_config(config)?;
        Self::spawn(managed).await.map(Some)
    }

    /// Spawn CouchDB with an already validated config
    pub async fn spawn(config: ManagedProcessConfig) -> Result<Arc<Self>, StartupError> {
        let (state_tx, state_rx) = watch::channel(ProcessState::Stopped);

        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(io_error(&data_dir))?;
        let ini_path = config.ini_path();
        tokio::fs::write(&ini_path, config.render_ini())
            .await
            .map_err(io_error(&ini_path))?;
        let stdout = open_log(&config.stdout_path())?;
        let stderr = open_log(&config.stderr_path())?;

        state_tx.send_replace(ProcessState::Starting);
        info!(
            executable = %config.executable.display(),
            port = config.port,
            storage = %config.storage_prefix.display(),
            "Starting CouchDB"
        );

        let mut cmd = Command::new(&config.executable);
        cmd.args(config.args());
        cmd.current_dir(&config.storage_prefix);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));
        cmd.kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                state_tx.send_replace(ProcessState::Failed);
                error!(executable = %config.executable.display(), error = %source, "CouchDB failed to start");
                return Err(StartupError::Spawn {
                    executable: config.executable.display().to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        state_tx.send_replace(ProcessState::Running);
        info!(pid, port = config.port, "CouchDB process spawned");

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(monitor(child, stop_rx, state_tx, config.shutdown_grace_period));

        Ok(Arc::new(Self {
            config,
            pid,
            state_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
        }))
    }

    pub fn config(&self) -> &ManagedProcessConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Stop CouchDB and wait until it has exited.
    ///
    /// Safe to call from several shutdown paths at once: only the first call
    /// terminates the process, the others wait for it and report
    /// [`StopOutcome::AlreadyStopped`].
    pub async fn stop(&self) -> StopOutcome {
        let requested = match self.stop_tx.lock().take() {
            Some(tx) if !self.state().is_finished() => {
                info!(pid = self.pid, "Stopping CouchDB...");
                tx.send(()).is_ok()
            }
            _ => false,
        };

        let mut state_rx = self.state_rx.clone();
        if state_rx.wait_for(|state| state.is_finished()).await.is_err() {
            warn!("CouchDB monitor ended without reporting a final state");
        }

        if requested {
            StopOutcome::Stopped
        } else {
            debug!("CouchDB already stopped");
            StopOutcome::AlreadyStopped
        }
    }
}

/// Owns the child until it exits or a stop is requested
async fn monitor(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ProcessState>,
    grace_period: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            // Errors after startup have no caller left to report to
            match status {
                Ok(status) => error!(?status, "CouchDB exited unexpectedly"),
                Err(e) => error!(error = %e, "CouchDB Error"),
            }
            state_tx.send_replace(ProcessState::Failed);
        }
        _ = stop_rx => {
            terminate(&mut child, grace_period).await;
            state_tx.send_replace(ProcessState::Stopped);
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL
async fn terminate(child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        debug!(pid, "Sending SIGTERM to CouchDB");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "CouchDB stopped");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for CouchDB to exit");
        }
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            match tokio::time::timeout(KILL_TIMEOUT, child.kill()).await {
                Ok(Ok(())) => info!("CouchDB killed"),
                Ok(Err(e)) => error!(error = %e, "Failed to kill CouchDB"),
                Err(_) => error!("CouchDB did not exit after SIGKILL"),
            }
        }
    }
}
