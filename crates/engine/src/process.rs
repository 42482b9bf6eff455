//! Lifecycle of the external engine process.
//!
//! [`EngineProcessController`] launches the engine in its own process
//! group, waits for it to accept TCP connections, and tears the whole
//! group down with `SIGTERM`, a grace period, then `SIGKILL`.
//!
//! Liveness is always probed over the network rather than trusted from
//! the stored state, since the engine can die (or be started) outside
//! this process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};

/// Timeout for a single TCP liveness probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Observable state of the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How to launch and supervise the engine.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// `host:port` probed for liveness.
    pub address: String,
    /// Upper bound on waiting for the engine to become reachable.
    pub start_timeout: Duration,
    /// Delay between liveness probes while starting.
    pub probe_interval: Duration,
    /// Delay between `SIGTERM` and `SIGKILL`.
    pub stop_grace: Duration,
}

impl ProcessConfig {
    /// Launch ComfyUI through `conda run` in low-VRAM mode, listening on
    /// all interfaces.
    pub fn comfyui(comfyui_path: impl Into<PathBuf>, conda_env: &str, address: impl Into<String>) -> Self {
        Self {
            program: "conda".to_string(),
            args: ["run", "-n", conda_env, "python", "main.py", "--lowvram", "--listen", "0.0.0.0"]
                .into_iter()
                .map(String::from)
                .collect(),
            working_dir: comfyui_path.into(),
            address: address.into(),
            start_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Errors from starting the engine.
///
/// Stopping never fails: a process that is already gone counts as
/// stopped.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("engine did not become reachable within {}s", .waited.as_secs())]
    EngineStartTimeout { waited: Duration },

    #[error("failed to launch engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine exited during startup ({0})")]
    ExitedEarly(std::process::ExitStatus),

    /// The engine was killed while startup was still in progress.
    #[error("engine startup was aborted")]
    Aborted,
}

/// Operations the worker and abort paths need from the engine process.
#[async_trait]
pub trait EngineLifecycle: Send + Sync {
    /// Live reachability probe. Never fails.
    async fn is_running(&self) -> bool;

    /// Ensure the engine is running, launching it if unreachable.
    async fn start(&self) -> Result<(), ProcessError>;

    /// Graceful-then-forceful shutdown of a process this controller
    /// launched. No-op when none is held.
    async fn stop(&self);

    /// Operator-initiated shutdown. Safe from any state.
    async fn kill(&self);
}

struct Inner {
    state: EngineProcessState,
    child: Option<Child>,
    /// Incremented on every launch so a startup can tell whether it was
    /// pre-empted by a kill.
    launch: u64,
    /// Incremented on every kill. A startup that saw an older value must
    /// not launch.
    kills: u64,
}

/// Owns the engine process handle and its state.
pub struct EngineProcessController {
    config: ProcessConfig,
    inner: Mutex<Inner>,
    /// Serializes `start` and `stop`. `kill` does not take it so it can
    /// pre-empt a startup in progress.
    transition: tokio::sync::Mutex<()>,
}

impl EngineProcessController {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: EngineProcessState::Stopped,
                child: None,
                launch: 0,
                kills: 0,
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Last recorded state. Use [`EngineLifecycle::is_running`] for
    /// liveness.
    pub fn state(&self) -> EngineProcessState {
        self.lock().state
    }

    /// Process id of the launched engine (its process group id), if a
    /// handle is held.
    pub fn pid(&self) -> Option<u32> {
        self.lock().child.as_ref().and_then(Child::id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the data is
        // still a valid state/handle pair.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn kill_generation(&self) -> u64 {
        self.lock().kills
    }

    /// Launch the engine unless a kill has landed since `kills` was read.
    fn spawn(&self, kills: u64) -> Result<u64, ProcessError> {
        let mut inner = self.lock();
        if inner.kills != kills {
            return Err(ProcessError::Aborted);
        }
        inner.state = EngineProcessState::Starting;

        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                inner.state = EngineProcessState::Stopped;
                ProcessError::Spawn(e)
            })?;

        tracing::info!(
            pid = child.id(),
            program = %self.config.program,
            "Engine process launched",
        );

        inner.child = Some(child);
        inner.launch += 1;
        Ok(inner.launch)
    }

    /// Check the launch is still the current one and has not exited.
    fn startup_status(&self, launch: u64) -> Result<(), ProcessError> {
        let mut inner = self.lock();
        if inner.launch != launch || inner.state != EngineProcessState::Starting {
            return Err(ProcessError::Aborted);
        }
        if let Some(child) = inner.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ProcessError::ExitedEarly(status));
            }
        }
        Ok(())
    }

    async fn wait_until_reachable(&self, launch: u64) -> Result<(), ProcessError> {
        let started = Instant::now();

        loop {
            tokio::time::sleep(self.config.probe_interval).await;
            self.startup_status(launch)?;

            if self.is_running().await {
                let mut inner = self.lock();
                if inner.launch != launch || inner.state != EngineProcessState::Starting {
                    return Err(ProcessError::Aborted);
                }
                inner.state = EngineProcessState::Running;
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Engine is reachable",
                );
                return Ok(());
            }

            if started.elapsed() >= self.config.start_timeout {
                return Err(ProcessError::EngineStartTimeout {
                    waited: self.config.start_timeout,
                });
            }
        }
    }

    /// Take the handle and shut its process group down.
    async fn terminate(&self, reason: &'static str) {
        let child = {
            let mut inner = self.lock();
            match inner.child.take() {
                Some(child) => {
                    inner.state = EngineProcessState::Stopping;
                    child
                }
                None => {
                    if inner.state != EngineProcessState::Starting {
                        inner.state = EngineProcessState::Stopped;
                    }
                    tracing::debug!(reason, "No engine process held, nothing to stop");
                    return;
                }
            }
        };

        let mut child = child;
        match child.id() {
            Some(pid) => {
                tracing::info!(pid, reason, "Shutting down engine process group");
                send_group_signal(pid, libc::SIGTERM, "SIGTERM");
                tokio::time::sleep(self.config.stop_grace).await;
                send_group_signal(pid, libc::SIGKILL, "SIGKILL");
            }
            None => {
                tracing::info!(reason, "Engine process had already been reaped");
            }
        }

        if let Err(e) = child.wait().await {
            tracing::warn!(error = %e, "Failed to reap engine process");
        }

        let mut inner = self.lock();
        if inner.child.is_none() {
            inner.state = EngineProcessState::Stopped;
        }
        tracing::info!(reason, "Engine process group terminated");
    }
}

#[async_trait]
impl EngineLifecycle for EngineProcessController {
    async fn is_running(&self) -> bool {
        matches!(
            tokio::time::timeout(
                PROBE_CONNECT_TIMEOUT,
                tokio::net::TcpStream::connect(self.config.address.as_str()),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn start(&self) -> Result<(), ProcessError> {
        let _transition = self.transition.lock().await;
        let kills = self.kill_generation();

        if self.is_running().await {
            let mut inner = self.lock();
            inner.state = EngineProcessState::Running;
            tracing::debug!(address = %self.config.address, "Engine already running");
            return Ok(());
        }

        if self.pid().is_some() {
            // Launched earlier but no longer reachable.
            self.terminate("stale process").await;
        }

        tracing::info!(address = %self.config.address, "Starting engine");
        let launch = match self.spawn(kills) {
            Ok(launch) => launch,
            Err(ProcessError::Aborted) => {
                tracing::warn!("Engine killed before launch, not starting");
                return Err(ProcessError::Aborted);
            }
            Err(e) => return Err(e),
        };

        match self.wait_until_reachable(launch).await {
            Ok(()) => Ok(()),
            Err(ProcessError::Aborted) => {
                tracing::warn!("Engine startup pre-empted by kill");
                Err(ProcessError::Aborted)
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine failed to start");
                self.terminate("startup failed").await;
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        let _transition = self.transition.lock().await;
        self.terminate("stop").await;
    }

    async fn kill(&self) {
        {
            // Stops a pending start from launching, and fails one that
            // already launched at its next poll.
            let mut inner = self.lock();
            inner.kills += 1;
            if inner.child.is_none() {
                inner.state = EngineProcessState::Stopped;
            }
        }
        self.terminate("kill").await;
    }
}

/// Signal an entire process group, treating a vanished group as success.
fn send_group_signal(pgid: u32, signal: libc::c_int, name: &'static str) {
    // SAFETY: killpg takes plain integers and has no memory-safety
    // preconditions.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        tracing::debug!(pgid, signal = name, "Signal sent to engine process group");
        return;
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        tracing::info!(pgid, signal = name, "Engine process group already gone");
    } else {
        tracing::warn!(pgid, signal = name, error = %err, "Failed to signal engine process group");
    }
}
