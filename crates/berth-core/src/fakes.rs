//! In-memory runtimes for unit tests.

use async_trait::async_trait;
use berth_runtime::{
    ContainerRuntime, ContainerSpec, ContainerStats, ContainerSummary, ExecInspect, ExecOutput,
    ExecSpec, OutputChunk, PodRuntime, PodSnapshot, PodTemplate, Result, RuntimeError,
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Encode one multiplexed frame.
pub fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reply of a scripted command.
#[derive(Debug, Clone, Default)]
pub struct FakeReply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl FakeReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn fail(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }
}

type Responder = Arc<dyn Fn(&[String]) -> FakeReply + Send + Sync>;

fn not_found(message: String) -> RuntimeError {
    RuntimeError::api(404, message)
}

/// Does a label set match a `a=b,c` selector?
fn selector_matches(labels: &BTreeMap<String, String>, terms: &[String]) -> bool {
    terms.iter().all(|term| match term.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(term.as_str()),
    })
}

// Containers

enum Script {
    Frames(Vec<Vec<u8>>, Option<i64>),
    Error(Vec<Vec<u8>>),
    Live(mpsc::UnboundedReceiver<Vec<u8>>),
}

struct FakeContainer {
    labels: HashMap<String, String>,
    running: bool,
}

#[derive(Default)]
struct ContainerState {
    next_id: u64,
    images: HashSet<String>,
    pulled: Vec<String>,
    pull_error: Option<String>,
    containers: HashMap<String, FakeContainer>,
    removed: usize,
    scripts: VecDeque<Script>,
    pending: HashMap<String, Script>,
    exit_codes: HashMap<String, Option<i64>>,
    exec_specs: Vec<ExecSpec>,
    responder: Option<Responder>,
}

/// [`ContainerRuntime`] that keeps containers in memory and answers execs
/// with multiplexed frames.
#[derive(Default)]
pub struct FakeContainerRuntime {
    state: Mutex<ContainerState>,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap()
    }

    pub fn add_container(&self, id: &str) {
        self.state().containers.insert(
            id.to_string(),
            FakeContainer {
                labels: HashMap::new(),
                running: true,
            },
        );
    }

    pub fn remove_all(&self) {
        self.state().containers.clear();
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state().containers.get(id).is_some_and(|c| c.running)
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn removed_count(&self) -> usize {
        self.state().removed
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }

    pub fn fail_pulls(&self, message: &str) {
        self.state().pull_error = Some(message.to_string());
    }

    pub fn script_exec(&self, chunks: Vec<Vec<u8>>, exit_code: Option<i64>) {
        self.state()
            .scripts
            .push_back(Script::Frames(chunks, exit_code));
    }

    pub fn script_exec_error(&self, chunks: Vec<Vec<u8>>) {
        self.state().scripts.push_back(Script::Error(chunks));
    }

    /// Next exec streams whatever is sent until the sender is dropped.
    pub fn script_exec_live(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().scripts.push_back(Script::Live(rx));
        tx
    }

    /// Answer unscripted execs by command line.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&[String]) -> FakeReply + Send + Sync + 'static,
    {
        self.state().responder = Some(Arc::new(responder));
    }

    pub fn last_exec_spec(&self) -> Option<ExecSpec> {
        self.state().exec_specs.last().cloned()
    }

    pub fn exec_specs(&self) -> Vec<ExecSpec> {
        self.state().exec_specs.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(message) = &state.pull_error {
            return Err(RuntimeError::api(404, message.clone()));
        }
        state.images.insert(image.to_string());
        state.pulled.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self.state().containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::api(404, format!("No such container: {id}"))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        match self.state().containers.get_mut(id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::api(404, format!("No such container: {id}"))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        match state.containers.remove(id) {
            Some(_) => {
                state.removed += 1;
                Ok(())
            }
            None => Err(RuntimeError::api(404, format!("No such container: {id}"))),
        }
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<ContainerSummary>> {
        let state = self.state();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| {
                let sorted: BTreeMap<String, String> = c.labels.clone().into_iter().collect();
                selector_matches(&sorted, labels)
            })
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                labels: c.labels.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
                created_at: Utc::now(),
            })
            .collect())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        if !self.state().containers.contains_key(id) {
            return Err(RuntimeError::api(404, format!("No such container: {id}")));
        }
        Ok(ContainerStats {
            cpu_percent: 12.5,
            memory_bytes: 64 * 1024 * 1024,
            memory_limit_bytes: 2048 * 1024 * 1024,
        })
    }

    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        let mut state = self.state();
        if !state.containers.contains_key(container_id) {
            return Err(RuntimeError::api(
                404,
                format!("No such container: {container_id}"),
            ));
        }
        state.exec_specs.push(spec.clone());
        state.next_id += 1;
        let exec_id = format!("e{:04}", state.next_id);

        let script = match state.scripts.pop_front() {
            Some(script) => script,
            None => {
                let reply = state
                    .responder
                    .as_ref()
                    .map(|r| r(&spec.command))
                    .unwrap_or_default();
                let mut chunks = Vec::new();
                if !reply.stdout.is_empty() {
                    chunks.push(frame(1, reply.stdout.as_bytes()));
                }
                if !reply.stderr.is_empty() {
                    chunks.push(frame(2, reply.stderr.as_bytes()));
                }
                Script::Frames(chunks, Some(reply.exit_code))
            }
        };
        let exit_code = match &script {
            Script::Frames(_, code) => *code,
            Script::Error(_) | Script::Live(_) => None,
        };
        state.exit_codes.insert(exec_id.clone(), exit_code);
        state.pending.insert(exec_id.clone(), script);
        Ok(exec_id)
    }

    async fn exec_start(&self, exec_id: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let script = self
            .state()
            .pending
            .remove(exec_id)
            .ok_or_else(|| not_found(format!("No such exec instance: {exec_id}")))?;

        Ok(match script {
            Script::Frames(chunks, _) => {
                stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed()
            }
            Script::Error(chunks) => stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
                .chain(stream::once(async {
                    Err(RuntimeError::Stream("connection reset".into()))
                }))
                .boxed(),
            Script::Live(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|c| (Ok(Bytes::from(c)), rx))
            })
            .boxed(),
        })
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect> {
        let exit_code = self.state().exit_codes.get(exec_id).copied().flatten();
        Ok(ExecInspect {
            exit_code,
            running: false,
        })
    }
}

// Pods

#[derive(Default)]
struct PodState {
    next_version: u64,
    pods: BTreeMap<String, PodSnapshot>,
    created: Vec<String>,
    deleted: Vec<String>,
    create_phase: Option<String>,
    create_waiting_reason: Option<String>,
    failing_creates: usize,
    conflict_next_patch: bool,
    exec_specs: Vec<(String, ExecSpec)>,
    responder: Option<Responder>,
}

impl PodState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// [`PodRuntime`] that keeps pods in memory and enforces resource-version
/// preconditions on label patches.
#[derive(Default)]
pub struct FakePodRuntime {
    state: Mutex<PodState>,
}

impl FakePodRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PodState> {
        self.state.lock().unwrap()
    }

    /// Insert a pod as if another process had created it.
    pub fn insert_pod(&self, name: &str, labels: &[(String, String)], phase: &str) {
        let mut state = self.state();
        let version = state.bump();
        state.pods.insert(
            name.to_string(),
            PodSnapshot {
                name: name.to_string(),
                labels: labels.iter().cloned().collect(),
                phase: Some(phase.to_string()),
                resource_version: Some(version),
                created_at: Some(Utc::now()),
                ..Default::default()
            },
        );
    }

    /// Remove a pod without going through the runtime API.
    pub fn vanish(&self, name: &str) {
        self.state().pods.remove(name);
    }

    pub fn set_phase(&self, name: &str, phase: &str) {
        let mut state = self.state();
        let version = state.bump();
        if let Some(pod) = state.pods.get_mut(name) {
            pod.phase = Some(phase.to_string());
            pod.resource_version = Some(version);
        }
    }

    /// Phase and waiting reason of pods created from now on.
    pub fn set_create_phase(&self, phase: &str, waiting_reason: Option<&str>) {
        let mut state = self.state();
        state.create_phase = Some(phase.to_string());
        state.create_waiting_reason = waiting_reason.map(str::to_string);
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.state().failing_creates = count;
    }

    pub fn conflict_next_patch(&self) {
        self.state().conflict_next_patch = true;
    }

    pub fn pod(&self, name: &str) -> Option<PodSnapshot> {
        self.state().pods.get(name).cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state().pods.keys().cloned().collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.state().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&[String]) -> FakeReply + Send + Sync + 'static,
    {
        self.state().responder = Some(Arc::new(responder));
    }

    pub fn exec_specs(&self) -> Vec<(String, ExecSpec)> {
        self.state().exec_specs.clone()
    }
}

#[async_trait]
impl PodRuntime for FakePodRuntime {
    async fn list_pods(&self, selector: &str) -> Result<Vec<PodSnapshot>> {
        let terms: Vec<String> = selector
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Ok(self
            .state()
            .pods
            .values()
            .filter(|p| selector_matches(&p.labels, &terms))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodSnapshot>> {
        Ok(self.state().pods.get(name).cloned())
    }

    async fn create_pod(&self, template: &PodTemplate) -> Result<PodSnapshot> {
        let mut state = self.state();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(RuntimeError::api(403, "exceeded quota"));
        }
        if state.pods.contains_key(&template.name) {
            return Err(RuntimeError::api(409, "pod already exists"));
        }
        let version = state.bump();
        let pod = PodSnapshot {
            name: template.name.clone(),
            labels: template.labels.clone(),
            phase: Some(
                state
                    .create_phase
                    .clone()
                    .unwrap_or_else(|| "Running".to_string()),
            ),
            resource_version: Some(version),
            created_at: Some(Utc::now()),
            deleting: false,
            waiting_reason: state.create_waiting_reason.clone(),
        };
        state.pods.insert(template.name.clone(), pod.clone());
        state.created.push(template.name.clone());
        Ok(pod)
    }

    async fn patch_labels(
        &self,
        name: &str,
        resource_version: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<PodSnapshot> {
        let mut state = self.state();
        if std::mem::take(&mut state.conflict_next_patch) {
            return Err(RuntimeError::api(409, "the object has been modified"));
        }
        let version = state.bump();
        let pod = state
            .pods
            .get_mut(name)
            .ok_or_else(|| not_found(format!("pods \"{name}\" not found")))?;
        if let Some(expected) = resource_version {
            if pod.resource_version.as_deref() != Some(expected) {
                return Err(RuntimeError::api(409, "the object has been modified"));
            }
        }
        pod.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        pod.resource_version = Some(version);
        Ok(pod.clone())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        match state.pods.remove(name) {
            Some(_) => {
                state.deleted.push(name.to_string());
                Ok(())
            }
            None => Err(RuntimeError::api(404, format!("pods \"{name}\" not found"))),
        }
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput> {
        let mut state = self.state();
        if !state.pods.contains_key(name) {
            return Err(RuntimeError::api(404, format!("pods \"{name}\" not found")));
        }
        state.exec_specs.push((name.to_string(), spec.clone()));
        let reply = state
            .responder
            .as_ref()
            .map(|r| r(&spec.command))
            .unwrap_or_default();

        let mut chunks = Vec::new();
        if !reply.stdout.is_empty() {
            chunks.push(Ok(OutputChunk::stdout(reply.stdout)));
        }
        if !reply.stderr.is_empty() {
            chunks.push(Ok(OutputChunk::stderr(reply.stderr)));
        }
        let exit_code = reply.exit_code;
        Ok(ExecOutput {
            chunks: stream::iter(chunks).boxed(),
            exit_code: async move { Ok(Some(exit_code)) }.boxed(),
        })
    }
}
