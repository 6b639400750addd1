//! Sandbox type - one running container or pod.

use crate::backend::SandboxBackend;
use crate::error::{CoreError, Result};
use berth_runtime::{ExecOutput, StreamKind};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a sandbox.
///
/// ```text
/// creating ──▶ running ──▶ stopping ──▶ stopped
///     │
///     └──────▶ error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Runtime unit being allocated.
    Creating,
    /// Ready for commands.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Torn down.
    Stopped,
    /// Creation failed.
    Error,
}

impl SandboxStatus {
    /// True for every status except `Stopped`.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Result from command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    /// Process exit code (0 when the runtime reported none).
    pub exit_code: i64,
    /// Standard output, trimmed.
    pub stdout: String,
    /// Standard error, trimmed.
    pub stderr: String,
}

impl ExecResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for [`Sandbox::exec_with`] and [`Sandbox::exec_stream`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Run as root instead of the sandbox user.
    pub as_root: bool,
    /// Extra environment, overriding the sandbox defaults.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub working_dir: Option<String>,
}

impl ExecOptions {
    /// Options for running `command`.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Run as root.
    pub fn as_root(mut self, as_root: bool) -> Self {
        self.as_root = as_root;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Environment in `KEY=value` form.
    pub fn env_entries(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Resource usage of a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SandboxMetrics {
    /// CPU usage percentage.
    pub cpu_percent: f64,
    /// Memory in use, in bytes.
    pub memory_bytes: u64,
    /// Memory limit, in bytes.
    pub memory_limit_bytes: u64,
}

/// Point-in-time snapshot of a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    /// Sandbox id.
    pub id: SandboxId,
    /// Owning project.
    pub project_id: String,
    /// Container id or pod name.
    pub runtime_handle: String,
    /// Status at snapshot time.
    pub status: SandboxStatus,
    /// Backend name (`docker`, `cluster`).
    pub backend: &'static str,
    /// True if the unit came from the warm pool.
    pub pooled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last exec or explicit touch.
    pub last_activity: DateTime<Utc>,
    /// Idle timeout in seconds.
    pub idle_timeout_secs: u64,
}

struct SandboxState {
    status: SandboxStatus,
    last_activity: DateTime<Utc>,
}

/// A sandbox hosted by a container or pod.
///
/// Sandboxes are owned by a [`SandboxProvider`](crate::SandboxProvider) and
/// handed out as `Arc<Sandbox>`.
pub struct Sandbox {
    id: SandboxId,
    project_id: String,
    runtime_handle: String,
    backend: Arc<dyn SandboxBackend>,
    env: BTreeMap<String, String>,
    idle_timeout: Duration,
    pooled: bool,
    created_at: DateTime<Utc>,
    state: Mutex<SandboxState>,
}

/// Fields needed to construct a [`Sandbox`].
pub(crate) struct SandboxParts {
    pub id: SandboxId,
    pub project_id: String,
    pub runtime_handle: String,
    pub status: SandboxStatus,
    pub env: BTreeMap<String, String>,
    pub idle_timeout: Duration,
    pub pooled: bool,
    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    pub(crate) fn new(parts: SandboxParts, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            id: parts.id,
            project_id: parts.project_id,
            runtime_handle: parts.runtime_handle,
            backend,
            env: parts.env,
            idle_timeout: parts.idle_timeout,
            pooled: parts.pooled,
            created_at: parts.created_at,
            state: Mutex::new(SandboxState {
                status: parts.status,
                last_activity: Utc::now(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the sandbox ID.
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Project the sandbox belongs to.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Container id or pod name.
    pub fn runtime_handle(&self) -> &str {
        &self.runtime_handle
    }

    /// Current status.
    pub fn status(&self) -> SandboxStatus {
        self.state().status
    }

    /// When the sandbox was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last exec or touch.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state().last_activity
    }

    /// True if the unit came from the warm pool.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Mark the sandbox as active now.
    pub fn touch(&self) {
        self.state().last_activity = Utc::now();
    }

    /// True if nothing touched the sandbox for longer than its idle timeout.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_activity());
        idle.to_std().is_ok_and(|d| d > self.idle_timeout)
    }

    /// Snapshot of the sandbox.
    pub fn info(&self) -> SandboxInfo {
        let state = self.state();
        SandboxInfo {
            id: self.id,
            project_id: self.project_id.clone(),
            runtime_handle: self.runtime_handle.clone(),
            status: state.status,
            backend: self.backend.name(),
            pooled: self.pooled,
            created_at: self.created_at,
            last_activity: state.last_activity,
            idle_timeout_secs: self.idle_timeout.as_secs(),
        }
    }

    pub(crate) fn set_status(&self, status: SandboxStatus) {
        let mut state = self.state();
        tracing::trace!(
            sandbox_id = %self.id,
            from = %state.status,
            to = %status,
            "Sandbox status change"
        );
        state.status = status;
    }

    /// Run `cmd` with `args` and wait for it to finish.
    pub async fn exec(&self, cmd: &str, args: &[&str], as_root: bool) -> Result<ExecResult> {
        let command = std::iter::once(cmd).chain(args.iter().copied());
        self.exec_with(ExecOptions::new(command).as_root(as_root))
            .await
    }

    /// Run a command with full options and wait for it to finish.
    pub async fn exec_with(&self, options: ExecOptions) -> Result<ExecResult> {
        let start = std::time::Instant::now();
        tracing::debug!(sandbox_id = %self.id, command = ?options.command, "Executing command");

        let output = self.start_exec(options).await?;
        let result = collect_output(output).await;
        self.touch();

        if let Ok(ref r) = result {
            tracing::debug!(
                sandbox_id = %self.id,
                exit_code = r.exit_code,
                stdout_len = r.stdout.len(),
                stderr_len = r.stderr.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Command completed"
            );
        }
        result
    }

    /// Run a command and stream its output as it arrives.
    pub async fn exec_stream(&self, options: ExecOptions) -> Result<ExecStream> {
        tracing::debug!(
            sandbox_id = %self.id,
            command = ?options.command,
            "Starting streaming exec"
        );
        let output = self.start_exec(options).await?;
        Ok(ExecStream::spawn(output, self.id))
    }

    /// Sample resource usage.
    pub async fn metrics(&self) -> Result<SandboxMetrics> {
        self.backend.metrics(&self.runtime_handle).await
    }

    /// Stop the sandbox and release its runtime unit.
    ///
    /// Idempotent: stopping a stopped (or stopping) sandbox succeeds.
    pub async fn stop(&self) -> Result<()> {
        let previous = {
            let mut state = self.state();
            match state.status {
                SandboxStatus::Stopped | SandboxStatus::Stopping => return Ok(()),
                previous => {
                    state.status = SandboxStatus::Stopping;
                    previous
                }
            }
        };

        let start = std::time::Instant::now();
        tracing::info!(sandbox_id = %self.id, handle = %self.runtime_handle, "Stopping sandbox");

        match self.backend.destroy_unit(&self.runtime_handle).await {
            Ok(()) | Err(CoreError::ContainerNotFound(_)) => {
                self.set_status(SandboxStatus::Stopped);
                tracing::info!(
                    sandbox_id = %self.id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox stopped"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(sandbox_id = %self.id, error = %e, "Failed to stop sandbox");
                self.set_status(previous);
                Err(e)
            }
        }
    }

    async fn start_exec(&self, mut options: ExecOptions) -> Result<ExecOutput> {
        self.touch();
        self.ensure_running()?;

        for (key, value) in &self.env {
            options
                .env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self.backend.exec(&self.runtime_handle, &options).await
    }

    /// Ensure the sandbox is in the Running state.
    fn ensure_running(&self) -> Result<()> {
        let status = self.status();
        if status != SandboxStatus::Running {
            return Err(CoreError::ExecFailed(format!(
                "sandbox {} is {status}, expected running",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("runtime_handle", &self.runtime_handle)
            .field("status", &self.status())
            .finish()
    }
}

/// Drain an exec's output into an [`ExecResult`].
pub(crate) async fn collect_output(output: ExecOutput) -> Result<ExecResult> {
    let ExecOutput {
        mut chunks,
        exit_code,
    } = output;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| CoreError::ExecFailed(e.to_string()))?;
        match chunk.kind {
            StreamKind::Stdout => stdout.extend_from_slice(&chunk.data),
            StreamKind::Stderr => stderr.extend_from_slice(&chunk.data),
        }
    }

    let exit_code = exit_code
        .await
        .map_err(|e| CoreError::ExecFailed(e.to_string()))?
        .unwrap_or(0);

    Ok(ExecResult {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
    })
}

/// A running command with live output.
///
/// Output is pushed into [`stdout`](Self::stdout) and
/// [`stderr`](Self::stderr) as it arrives; both channels close when the
/// command ends or after [`kill`](Self::kill).
///
/// `kill()` only stops forwarding output. The process inside the sandbox is
/// not signalled and may keep running.
pub struct ExecStream {
    /// Standard output payloads.
    pub stdout: mpsc::UnboundedReceiver<Bytes>,
    /// Standard error payloads.
    pub stderr: mpsc::UnboundedReceiver<Bytes>,
    killed: Arc<AtomicBool>,
    kill_signal: Arc<Notify>,
    exit: Option<oneshot::Receiver<Result<i64>>>,
}

/// Exit code reported by [`ExecStream::wait`] when the stream was killed
/// before the runtime recorded a code.
pub const KILLED_EXIT_CODE: i64 = -1;

/// How long a killed stream waits for the runtime to report an exit code.
const KILLED_EXIT_GRACE: Duration = Duration::from_secs(1);

impl ExecStream {
    fn spawn(output: ExecOutput, sandbox_id: SandboxId) -> Self {
        let (stdout_tx, stdout) = mpsc::unbounded_channel();
        let (stderr_tx, stderr) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let killed = Arc::new(AtomicBool::new(false));
        let kill_signal = Arc::new(Notify::new());

        let task_killed = Arc::clone(&killed);
        let task_signal = Arc::clone(&kill_signal);
        tokio::spawn(async move {
            let ExecOutput {
                mut chunks,
                exit_code,
            } = output;

            let outcome = loop {
                tokio::select! {
                    biased;

                    _ = task_signal.notified() => {
                        tracing::debug!(sandbox_id = %sandbox_id, "Exec stream killed");
                        break Ok(());
                    }

                    item = chunks.next() => match item {
                        Some(Ok(chunk)) => {
                            if task_killed.load(Ordering::Acquire) {
                                break Ok(());
                            }
                            let tx = match chunk.kind {
                                StreamKind::Stdout => &stdout_tx,
                                StreamKind::Stderr => &stderr_tx,
                            };
                            let _ = tx.send(chunk.data);
                        }
                        Some(Err(e)) => break Err(CoreError::ExecFailed(e.to_string())),
                        None => break Ok(()),
                    }
                }
            };
            drop(chunks);
            drop(stdout_tx);
            drop(stderr_tx);

            let result = match outcome {
                Err(e) => Err(e),
                Ok(()) if task_killed.load(Ordering::Acquire) => {
                    // Some runtimes only report a code once the process exits.
                    match tokio::time::timeout(KILLED_EXIT_GRACE, exit_code).await {
                        Ok(Ok(Some(code))) => Ok(code),
                        _ => Ok(KILLED_EXIT_CODE),
                    }
                }
                Ok(()) => exit_code
                    .await
                    .map(|code| code.unwrap_or(0))
                    .map_err(|e| CoreError::ExecFailed(e.to_string())),
            };
            let _ = exit_tx.send(result);
        });

        Self {
            stdout,
            stderr,
            killed,
            kill_signal,
            exit: Some(exit_rx),
        }
    }

    /// Stop forwarding output. Does not terminate the process.
    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            self.kill_signal.notify_one();
        }
    }

    /// True once [`kill`](Self::kill) was called.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Wait for the stream to end and return the exit code.
    ///
    /// A missing exit code is reported as 0. After `kill()` this returns
    /// within a second on every backend, with [`KILLED_EXIT_CODE`] unless
    /// the runtime already knows the real code.
    pub async fn wait(&mut self) -> Result<i64> {
        let Some(exit) = self.exit.take() else {
            return Err(CoreError::ExecFailed("exec stream already awaited".into()));
        };
        exit.await
            .map_err(|_| CoreError::ExecFailed("exec stream task died".into()))?
    }
}

impl fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStream")
            .field("killed", &self.is_killed())
            .finish_non_exhaustive()
    }
}
