//! Named tmux sessions inside sandboxes.
//!
//! Every call goes through the sandbox's exec primitive. The local index is
//! only bookkeeping (task ids, creation order); the live `tmux` server inside
//! the sandbox is the source of truth and is re-queried on every read.

use crate::error::{CoreError, Result};
use crate::provider::SandboxProvider;
use crate::sandbox::{ExecOptions, ExecResult, Sandbox, SandboxId, SandboxStatus};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const LIST_FORMAT: &str =
    "#{session_name}|#{session_windows}|#{session_attached}|#{session_created}";

/// stderr fragments meaning there is nothing to act on.
const GONE_MARKERS: &[&str] = &[
    "can't find session",
    "session not found",
    "no server running",
    "error connecting",
];

/// A tmux session running in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TmuxSession {
    pub name: String,
    pub sandbox_id: SandboxId,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub window_count: u32,
    pub attached: bool,
}

/// Live session as reported by `tmux list-sessions`.
#[derive(Debug, PartialEq, Eq)]
struct LiveSession {
    name: String,
    windows: u32,
    attached: bool,
    created_at: Option<DateTime<Utc>>,
}

fn parse_sessions(stdout: &str) -> Vec<LiveSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().splitn(4, '|');
            let name = fields.next().filter(|n| !n.is_empty())?;
            let windows = fields.next().and_then(|w| w.parse().ok()).unwrap_or(1);
            let attached = fields
                .next()
                .and_then(|a| a.parse::<u32>().ok())
                .is_some_and(|a| a > 0);
            let created_at = fields
                .next()
                .and_then(|c| c.parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
            Some(LiveSession {
                name: name.to_string(),
                windows,
                attached,
                created_at,
            })
        })
        .collect()
}

fn is_gone(result: &ExecResult) -> bool {
    let stderr = result.stderr.to_lowercase();
    GONE_MARKERS.iter().any(|m| stderr.contains(m))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['.', ':']) {
        return Err(CoreError::ExecFailed(format!(
            "invalid tmux session name: {name:?}"
        )));
    }
    Ok(())
}

/// `-t` value for exactly the session `name`. A bare name also matches
/// other sessions by prefix.
fn session_target(name: &str) -> String {
    format!("={name}")
}

/// `-t` value for the active pane of exactly the session `name`.
fn pane_target(name: &str) -> String {
    format!("={name}:")
}

fn tmux<I, S>(args: I) -> ExecOptions
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut argv = vec!["tmux".to_string()];
    argv.extend(args.into_iter().map(Into::into));
    ExecOptions::new(argv)
}

/// Tracks tmux sessions across the sandboxes of one provider.
pub struct TmuxManager {
    provider: Arc<SandboxProvider>,
    sessions: RwLock<HashMap<SandboxId, HashMap<String, TmuxSession>>>,
}

impl TmuxManager {
    pub fn new(provider: Arc<SandboxProvider>) -> Self {
        Self {
            provider,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Running sandbox for `sandbox_id`, purging local state if it is gone.
    async fn sandbox(&self, sandbox_id: SandboxId) -> Option<Arc<Sandbox>> {
        match self.provider.get_by_id(sandbox_id).await {
            Some(sandbox) if sandbox.status() == SandboxStatus::Running => Some(sandbox),
            _ => {
                self.forget_sandbox(sandbox_id).await;
                None
            }
        }
    }

    async fn require_sandbox(&self, sandbox_id: SandboxId) -> Result<Arc<Sandbox>> {
        self.sandbox(sandbox_id)
            .await
            .ok_or_else(|| CoreError::ContainerNotFound(sandbox_id.to_string()))
    }

    /// Run a tmux command, purging local state if the sandbox vanished.
    async fn run(&self, sandbox: &Sandbox, options: ExecOptions) -> Result<ExecResult> {
        match sandbox.exec_with(options).await {
            Err(CoreError::ContainerNotFound(handle)) => {
                self.forget_sandbox(sandbox.id()).await;
                Err(CoreError::ContainerNotFound(handle))
            }
            other => other,
        }
    }

    async fn live_sessions(&self, sandbox: &Sandbox) -> Result<Vec<LiveSession>> {
        let options = tmux(["list-sessions", "-F", LIST_FORMAT]);
        let result = self.run(sandbox, options).await?;
        if result.success() {
            Ok(parse_sessions(&result.stdout))
        } else if is_gone(&result) {
            Ok(Vec::new())
        } else {
            Err(CoreError::ExecFailed(format!(
                "tmux list-sessions exited with {}: {}",
                result.exit_code, result.stderr
            )))
        }
    }

    /// Create a detached session named `name`.
    pub async fn create_session(
        &self,
        sandbox_id: SandboxId,
        name: &str,
        task_id: Option<&str>,
        working_dir: Option<&str>,
    ) -> Result<TmuxSession> {
        validate_name(name)?;
        let sandbox = self.require_sandbox(sandbox_id).await?;

        let live = self.live_sessions(&sandbox).await?;
        if live.iter().any(|s| s.name == name) {
            return Err(CoreError::SessionAlreadyExists(name.to_string()));
        }

        let mut args = vec!["new-session", "-d", "-s", name];
        if let Some(dir) = working_dir {
            args.extend(["-c", dir]);
        }
        let result = self.run(&sandbox, tmux(args)).await?;
        if !result.success() {
            if result.stderr.contains("duplicate session") {
                return Err(CoreError::SessionAlreadyExists(name.to_string()));
            }
            return Err(CoreError::ExecFailed(format!(
                "tmux new-session exited with {}: {}",
                result.exit_code, result.stderr
            )));
        }

        let session = TmuxSession {
            name: name.to_string(),
            sandbox_id,
            task_id: task_id.map(str::to_string),
            created_at: Utc::now(),
            window_count: 1,
            attached: false,
        };
        self.sessions
            .write()
            .await
            .entry(sandbox_id)
            .or_default()
            .insert(name.to_string(), session.clone());

        tracing::info!(
            sandbox_id = %sandbox_id,
            session = name,
            task_id = ?task_id,
            "Tmux session created"
        );
        Ok(session)
    }

    /// Sessions currently alive in the sandbox.
    ///
    /// A sandbox that no longer exists has no sessions.
    pub async fn list_sessions(&self, sandbox_id: SandboxId) -> Result<Vec<TmuxSession>> {
        let Some(sandbox) = self.sandbox(sandbox_id).await else {
            return Ok(Vec::new());
        };
        let live = match self.live_sessions(&sandbox).await {
            Ok(live) => live,
            Err(CoreError::ContainerNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut index = self.sessions.write().await;
        let known = index.remove(&sandbox_id).unwrap_or_default();
        let mut refreshed = HashMap::with_capacity(live.len());
        for session in live {
            let previous = known.get(&session.name);
            let tracked = TmuxSession {
                sandbox_id,
                task_id: previous.and_then(|p| p.task_id.clone()),
                created_at: session
                    .created_at
                    .or(previous.map(|p| p.created_at))
                    .unwrap_or_else(Utc::now),
                window_count: session.windows,
                attached: session.attached,
                name: session.name,
            };
            refreshed.insert(tracked.name.clone(), tracked);
        }

        let mut sessions: Vec<TmuxSession> = refreshed.values().cloned().collect();
        sessions.sort_by_key(|s| (s.created_at, s.name.clone()));
        if !refreshed.is_empty() {
            index.insert(sandbox_id, refreshed);
        }
        Ok(sessions)
    }

    /// One live session, if present.
    pub async fn get_session(
        &self,
        sandbox_id: SandboxId,
        name: &str,
    ) -> Result<Option<TmuxSession>> {
        let sessions = self.list_sessions(sandbox_id).await?;
        Ok(sessions.into_iter().find(|s| s.name == name))
    }

    /// Type `command` into the session and press Enter.
    pub async fn send_command(
        &self,
        sandbox_id: SandboxId,
        name: &str,
        command: &str,
    ) -> Result<()> {
        validate_name(name)?;
        let sandbox = self.require_sandbox(sandbox_id).await?;

        let target = pane_target(name);
        for args in [
            vec!["send-keys", "-t", target.as_str(), "-l", command],
            vec!["send-keys", "-t", target.as_str(), "Enter"],
        ] {
            let result = self.run(&sandbox, tmux(args)).await?;
            self.check_session_result(sandbox_id, name, "send-keys", &result)
                .await?;
        }
        tracing::debug!(sandbox_id = %sandbox_id, session = name, "Command sent to tmux");
        Ok(())
    }

    /// Capture the visible pane, or the last `lines` lines of history.
    pub async fn capture_output(
        &self,
        sandbox_id: SandboxId,
        name: &str,
        lines: Option<u32>,
    ) -> Result<String> {
        validate_name(name)?;
        let sandbox = self.require_sandbox(sandbox_id).await?;

        let target = pane_target(name);
        let start;
        let mut args = vec!["capture-pane", "-p", "-t", target.as_str()];
        if let Some(lines) = lines {
            start = format!("-{lines}");
            args.extend(["-S", start.as_str()]);
        }
        let result = self.run(&sandbox, tmux(args)).await?;
        self.check_session_result(sandbox_id, name, "capture-pane", &result)
            .await?;
        Ok(result.stdout)
    }

    async fn check_session_result(
        &self,
        sandbox_id: SandboxId,
        name: &str,
        op: &str,
        result: &ExecResult,
    ) -> Result<()> {
        if result.success() {
            return Ok(());
        }
        if is_gone(result) {
            self.untrack(sandbox_id, name).await;
            return Err(CoreError::SessionNotFound(name.to_string()));
        }
        Err(CoreError::ExecFailed(format!(
            "tmux {op} exited with {}: {}",
            result.exit_code, result.stderr
        )))
    }

    /// Kill a session. A session or sandbox that is already gone counts as
    /// killed.
    pub async fn kill_session(&self, sandbox_id: SandboxId, name: &str) -> Result<()> {
        validate_name(name)?;
        let Some(sandbox) = self.sandbox(sandbox_id).await else {
            return Ok(());
        };

        let target = session_target(name);
        let options = tmux(["kill-session", "-t", target.as_str()]);
        let result = match self.run(&sandbox, options).await {
            Ok(result) => result,
            Err(CoreError::ContainerNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !result.success() && !is_gone(&result) {
            return Err(CoreError::ExecFailed(format!(
                "tmux kill-session exited with {}: {}",
                result.exit_code, result.stderr
            )));
        }

        self.untrack(sandbox_id, name).await;
        tracing::info!(sandbox_id = %sandbox_id, session = name, "Tmux session killed");
        Ok(())
    }

    /// Kill every tracked session of the sandbox. Returns how many were
    /// killed.
    pub async fn kill_all_sessions(&self, sandbox_id: SandboxId) -> usize {
        let names: Vec<String> = self
            .sessions
            .read()
            .await
            .get(&sandbox_id)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();

        let mut killed = 0;
        for name in names {
            match self.kill_session(sandbox_id, &name).await {
                Ok(()) => killed += 1,
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %sandbox_id,
                        session = %name,
                        error = %e,
                        "Failed to kill tmux session"
                    );
                }
            }
        }
        killed
    }

    /// Drop all local state for the sandbox.
    pub async fn forget_sandbox(&self, sandbox_id: SandboxId) {
        if self.sessions.write().await.remove(&sandbox_id).is_some() {
            tracing::debug!(sandbox_id = %sandbox_id, "Dropped tmux sessions of sandbox");
        }
    }

    async fn untrack(&self, sandbox_id: SandboxId, name: &str) {
        let mut index = self.sessions.write().await;
        if let Some(sessions) = index.get_mut(&sandbox_id) {
            sessions.remove(name);
            if sessions.is_empty() {
                index.remove(&sandbox_id);
            }
        }
    }

    /// Number of sessions tracked locally for the sandbox.
    pub async fn tracked_count(&self, sandbox_id: SandboxId) -> usize {
        self.sessions
            .read()
            .await
            .get(&sandbox_id)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::fakes::{FakeContainerRuntime, FakeReply};
    use crate::provider::ProviderConfig;
    use crate::{DockerBackend, DockerBackendConfig};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Minimal tmux server: session name to typed keys.
    type Server = Arc<Mutex<BTreeMap<String, Vec<String>>>>;

    fn arg_after<'a>(cmd: &'a [String], flag: &str) -> Option<&'a str> {
        cmd.iter()
            .position(|a| a == flag)
            .and_then(|i| cmd.get(i + 1))
            .map(String::as_str)
    }

    /// Resolve `-t` like tmux: `=name` (or `=name:`) matches exactly, a bare
    /// name falls back to the only session it prefixes.
    fn resolve(sessions: &BTreeMap<String, Vec<String>>, target: &str) -> Option<String> {
        if let Some(exact) = target.strip_prefix('=') {
            let exact = exact.strip_suffix(':').unwrap_or(exact);
            return sessions.contains_key(exact).then(|| exact.to_string());
        }
        let target = target.strip_suffix(':').unwrap_or(target);
        if sessions.contains_key(target) {
            return Some(target.to_string());
        }
        let mut prefixed = sessions.keys().filter(|k| k.starts_with(target));
        match (prefixed.next(), prefixed.next()) {
            (Some(only), None) => Some(only.clone()),
            _ => None,
        }
    }

    fn fake_tmux(server: &Server, cmd: &[String]) -> FakeReply {
        let mut sessions = server.lock().unwrap();
        let target = arg_after(cmd, "-t").unwrap_or_default();
        let resolved = resolve(&sessions, target);
        let missing = |name: &str| FakeReply::fail(1, format!("can't find session: {name}"));
        match cmd.get(1).map(String::as_str) {
            Some("list-sessions") if sessions.is_empty() => {
                FakeReply::fail(1, "no server running on /tmp/tmux-1000/default")
            }
            Some("list-sessions") => FakeReply::ok(
                sessions
                    .keys()
                    .map(|name| format!("{name}|1|0|1700000000\n"))
                    .collect::<String>(),
            ),
            Some("new-session") => {
                let name = arg_after(cmd, "-s").unwrap_or_default().to_string();
                if sessions.contains_key(&name) {
                    return FakeReply::fail(1, format!("duplicate session: {name}"));
                }
                sessions.insert(name, Vec::new());
                FakeReply::ok("")
            }
            Some("send-keys") => match resolved {
                Some(name) => {
                    let keys = sessions.entry(name).or_default();
                    keys.push(cmd[cmd.len() - 1].clone());
                    FakeReply::ok("")
                }
                None => missing(target),
            },
            Some("capture-pane") => match resolved {
                Some(name) => FakeReply::ok(sessions[&name].join("")),
                None => missing(target),
            },
            Some("kill-session") => match resolved {
                Some(name) => {
                    sessions.remove(&name);
                    FakeReply::ok("")
                }
                None => missing(target),
            },
            _ => FakeReply::fail(1, "unknown command"),
        }
    }

    async fn setup() -> (Arc<FakeContainerRuntime>, Server, TmuxManager, SandboxId) {
        let runtime = Arc::new(FakeContainerRuntime::new());
        let server: Server = Arc::default();
        let responder_server = Arc::clone(&server);
        runtime.respond_with(move |cmd| fake_tmux(&responder_server, cmd));

        let backend = DockerBackend::new(runtime.clone(), DockerBackendConfig::default());
        let provider = Arc::new(SandboxProvider::new(
            Arc::new(backend),
            ProviderConfig::default(),
        ));
        let config = SandboxConfig::builder()
            .project_id("proj-a")
            .image("berth/agent:latest")
            .build()
            .unwrap();
        let sandbox = provider.create(config).await.unwrap();

        (runtime, server, TmuxManager::new(provider), sandbox.id())
    }

    #[test]
    fn test_parse_sessions() {
        let parsed = parse_sessions("main|2|1|1700000000\nbuild|1|0|bogus\n\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "main");
        assert_eq!(parsed[0].windows, 2);
        assert!(parsed[0].attached);
        assert_eq!(parsed[0].created_at.unwrap().timestamp(), 1_700_000_000);
        assert!(!parsed[1].attached);
        assert!(parsed[1].created_at.is_none());
    }

    #[test]
    fn test_session_name_validation() {
        assert!(validate_name("agent-1").is_ok());
        for bad in ["", "a.b", "a:b"] {
            assert!(matches!(validate_name(bad), Err(CoreError::ExecFailed(_))));
        }
    }

    #[tokio::test]
    async fn test_create_duplicate_session() {
        let (runtime, _server, tmux, id) = setup().await;

        let session = tmux
            .create_session(id, "s1", Some("task-7"), Some("/workspace"))
            .await
            .unwrap();
        assert_eq!(session.task_id.as_deref(), Some("task-7"));

        let spec = runtime.last_exec_spec().unwrap();
        assert_eq!(
            spec.command,
            vec!["tmux", "new-session", "-d", "-s", "s1", "-c", "/workspace"]
        );
        assert_eq!(spec.user.as_deref(), Some("agent"));

        let err = tmux.create_session(id, "s1", None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionAlreadyExists(ref n) if n == "s1"));
    }

    #[tokio::test]
    async fn test_list_reflects_live_server() {
        let (_runtime, server, tmux, id) = setup().await;
        assert!(tmux.list_sessions(id).await.unwrap().is_empty());

        tmux.create_session(id, "s1", Some("task-1"), None)
            .await
            .unwrap();
        // Started by someone else inside the sandbox.
        server.lock().unwrap().insert("s2".into(), Vec::new());

        let sessions = tmux.list_sessions(id).await.unwrap();
        let names: Vec<&str> = sessions.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s1", "s2"]);
        assert_eq!(sessions[0].task_id.as_deref(), Some("task-1"));
        assert_eq!(sessions[1].task_id, None);

        // Exited on its own.
        server.lock().unwrap().remove("s1");
        assert!(tmux.get_session(id, "s1").await.unwrap().is_none());
        assert_eq!(tmux.tracked_count(id).await, 1);
    }

    #[tokio::test]
    async fn test_send_and_capture() {
        let (runtime, _server, tmux, id) = setup().await;
        tmux.create_session(id, "s1", None, None).await.unwrap();

        tmux.send_command(id, "s1", "ls -la").await.unwrap();
        let specs = runtime.exec_specs();
        let n = specs.len();
        assert_eq!(
            specs[n - 2].command,
            vec!["tmux", "send-keys", "-t", "=s1:", "-l", "ls -la"]
        );
        assert_eq!(
            specs[n - 1].command,
            vec!["tmux", "send-keys", "-t", "=s1:", "Enter"]
        );

        let output = tmux.capture_output(id, "s1", Some(50)).await.unwrap();
        assert_eq!(output, "ls -laEnter");
        assert_eq!(
            runtime.last_exec_spec().unwrap().command,
            vec!["tmux", "capture-pane", "-p", "-t", "=s1:", "-S", "-50"]
        );
    }

    #[tokio::test]
    async fn test_missing_session() {
        let (_runtime, _server, tmux, id) = setup().await;
        let err = tmux.send_command(id, "nope", "ls").await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
        let err = tmux.capture_output(id, "nope", None).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_kill_session_idempotent() {
        let (_runtime, _server, tmux, id) = setup().await;
        tmux.create_session(id, "s1", None, None).await.unwrap();

        tmux.kill_session(id, "s1").await.unwrap();
        tmux.kill_session(id, "s1").await.unwrap();
        assert_eq!(tmux.tracked_count(id).await, 0);
    }

    #[tokio::test]
    async fn test_prefix_sibling_is_not_targeted() {
        let (runtime, server, tmux, id) = setup().await;
        tmux.create_session(id, "s10", None, None).await.unwrap();

        tmux.kill_session(id, "s1").await.unwrap();
        assert_eq!(
            runtime.last_exec_spec().unwrap().command,
            vec!["tmux", "kill-session", "-t", "=s1"]
        );
        assert!(server.lock().unwrap().contains_key("s10"));

        let err = tmux.send_command(id, "s1", "rm -rf /").await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(ref n) if n == "s1"));
        let err = tmux.capture_output(id, "s1", None).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(ref n) if n == "s1"));
        assert!(server.lock().unwrap()["s10"].is_empty());
        assert_eq!(tmux.tracked_count(id).await, 1);
    }

    #[tokio::test]
    async fn test_prefix_siblings_stay_apart() {
        let (_runtime, server, tmux, id) = setup().await;
        tmux.create_session(id, "s1", None, None).await.unwrap();
        tmux.create_session(id, "s10", None, None).await.unwrap();

        tmux.send_command(id, "s1", "make").await.unwrap();
        let s1 = tmux.capture_output(id, "s1", None).await.unwrap();
        let s10 = tmux.capture_output(id, "s10", None).await.unwrap();
        assert_eq!(s1, "makeEnter");
        assert_eq!(s10, "");

        tmux.kill_session(id, "s1").await.unwrap();
        let names: Vec<String> = server.lock().unwrap().keys().cloned().collect();
        assert_eq!(names, vec!["s10"]);
    }

    #[tokio::test]
    async fn test_kill_all_sessions() {
        let (_runtime, server, tmux, id) = setup().await;
        tmux.create_session(id, "s1", None, None).await.unwrap();
        tmux.create_session(id, "s2", None, None).await.unwrap();
        server.lock().unwrap().remove("s1");

        assert_eq!(tmux.kill_all_sessions(id).await, 2);
        assert!(server.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_sandbox() {
        let (runtime, _server, tmux, id) = setup().await;
        tmux.create_session(id, "s1", None, None).await.unwrap();
        runtime.remove_all();

        let err = tmux.send_command(id, "s1", "ls").await.unwrap_err();
        assert!(matches!(err, CoreError::ContainerNotFound(_)));
        assert_eq!(tmux.tracked_count(id).await, 0);

        assert!(tmux.list_sessions(id).await.unwrap().is_empty());
        tmux.kill_session(id, "s1").await.unwrap();

        let err = tmux
            .capture_output(SandboxId::new(), "s1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ContainerNotFound(_)));
    }
}
