//! Docker Engine API client over the local Unix socket.
//!
//! Requests go straight to the Engine's HTTP API with hyper, so exec output
//! arrives as the raw multiplexed byte stream and is split by
//! [`demux`](crate::demux) rather than by a client library.

use crate::error::{Result, RuntimeError};
use crate::exec::ExecSpec;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use hyper::client::Client;
use hyper::{Body, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default Docker Engine socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Seconds the Engine waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: u32 = 10;

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Container name, `None` lets the Engine pick one.
    pub name: Option<String>,
    /// Image reference.
    pub image: String,
    /// Command overriding the image default.
    pub command: Vec<String>,
    /// Environment entries in `KEY=value` form.
    pub env: Vec<String>,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU limit in units of 1e-9 CPUs.
    pub nano_cpus: Option<i64>,
    /// Working directory.
    pub working_dir: Option<String>,
}

/// Summary row from a container listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Labels on the container.
    pub labels: HashMap<String, String>,
    /// Engine state (`created`, `running`, `exited`, ...).
    pub state: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ContainerSummary {
    /// True if the Engine reports the container as running.
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    /// CPU usage as a percentage of one core times online cores.
    pub cpu_percent: f64,
    /// Memory in use, in bytes.
    pub memory_bytes: u64,
    /// Memory limit, in bytes.
    pub memory_limit_bytes: u64,
}

/// State of an exec instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecInspect {
    /// Exit code, absent while running or when the Engine did not record one.
    pub exit_code: Option<i64>,
    /// True while the process is still running.
    pub running: bool,
}

/// Operations the sandbox core needs from a single-host container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// True if the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container. Starting a running container succeeds.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container. Stopping a stopped container succeeds.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Remove a container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// List containers (running or not) carrying all given `key=value` labels.
    async fn list_containers(&self, labels: &[String]) -> Result<Vec<ContainerSummary>>;

    /// Sample resource usage once.
    async fn container_stats(&self, id: &str) -> Result<ContainerStats>;

    /// Create an exec instance and return its id.
    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> Result<String>;

    /// Start an exec and return its raw multiplexed output.
    async fn exec_start(&self, exec_id: &str) -> Result<BoxStream<'static, Result<Bytes>>>;

    /// Inspect an exec instance.
    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect>;
}

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    socket_path: PathBuf,
    client: Client<UnixConnector, Body>,
}

impl DockerEngine {
    /// Client for the Engine listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        tracing::debug!(socket = %socket_path.display(), "Creating Docker Engine client");
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    /// Client for the default socket.
    pub fn local() -> Self {
        Self::new(DEFAULT_DOCKER_SOCKET)
    }

    /// Path of the Engine socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response<Body>> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        let builder = Request::builder().method(method.clone()).uri(uri);

        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&json)?)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| RuntimeError::InvalidRequest(e.to_string()))?;

        tracing::trace!(method = %method, path, "Docker API request");
        Ok(self.client.request(request).await?)
    }

    /// Send a request and fail on any status outside `accept`.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        accept: &[StatusCode],
    ) -> Result<Response<Body>> {
        let response = self.send(method, path, body).await?;
        let status = response.status();
        if status.is_success() || accept.contains(&status) {
            return Ok(response);
        }
        Err(api_error(response).await)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = self.call(method, path, body, &[]).await?;
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Turn a non-success response into an API error carrying the Engine's message.
async fn api_error(response: Response<Body>) -> RuntimeError {
    let status = response.status().as_u16();
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .unwrap_or_default();
    let message = serde_json::from_slice::<EngineMessage>(&body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());
    tracing::debug!(status, message = %message, "Docker API error");
    RuntimeError::api(status, message)
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let path = format!("/images/{}/json", image);
        let response = self.send(Method::GET, &path, None).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(api_error(response).await),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let start = std::time::Instant::now();
        tracing::info!(image, "Pulling image");

        let path = format!("/images/create?fromImage={}", urlencoding::encode(image));
        let response = self.call(Method::POST, &path, None, &[]).await?;

        // Pull failures after the headers are sent arrive as progress lines.
        let body = hyper::body::to_bytes(response.into_body()).await?;
        for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            if let Ok(progress) = serde_json::from_slice::<PullProgress>(line) {
                if let Some(error) = progress.error {
                    tracing::warn!(image, error = %error, "Image pull failed");
                    return Err(RuntimeError::api(500, error));
                }
            }
        }

        tracing::info!(
            image,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image pulled"
        );
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let path = match &spec.name {
            Some(name) => format!("/containers/create?name={}", urlencoding::encode(name)),
            None => "/containers/create".to_string(),
        };

        let mut host_config = serde_json::json!({ "Binds": spec.binds });
        if let Some(memory) = spec.memory_bytes {
            host_config["Memory"] = memory.into();
        }
        if let Some(nano_cpus) = spec.nano_cpus {
            host_config["NanoCpus"] = nano_cpus.into();
        }

        let mut body = serde_json::json!({
            "Image": spec.image,
            "Env": spec.env,
            "Labels": spec.labels,
            "HostConfig": host_config,
        });
        if !spec.command.is_empty() {
            body["Cmd"] = serde_json::json!(spec.command);
        }
        if let Some(dir) = &spec.working_dir {
            body["WorkingDir"] = dir.clone().into();
        }

        let created: CreatedResponse = self.call_json(Method::POST, &path, Some(body)).await?;
        for warning in created.warnings.unwrap_or_default() {
            tracing::warn!(
                container_id = %created.id,
                warning = %warning,
                "Container create warning"
            );
        }
        tracing::debug!(container_id = %created.id, image = %spec.image, "Container created");
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}/start", id);
        self.call(Method::POST, &path, None, &[StatusCode::NOT_MODIFIED])
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}/stop?t={}", id, STOP_TIMEOUT_SECS);
        self.call(Method::POST, &path, None, &[StatusCode::NOT_MODIFIED])
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{}?force=true&v=true", id);
        self.call(Method::DELETE, &path, None, &[]).await?;
        Ok(())
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<ContainerSummary>> {
        let filters = serde_json::json!({ "label": labels }).to_string();
        let path = format!(
            "/containers/json?all=true&filters={}",
            urlencoding::encode(&filters)
        );
        let rows: Vec<ContainerRow> = self.call_json(Method::GET, &path, None).await?;
        tracing::trace!(count = rows.len(), "Containers listed");

        Ok(rows
            .into_iter()
            .map(|row| ContainerSummary {
                id: row.id,
                labels: row.labels.unwrap_or_default(),
                state: row.state,
                created_at: DateTime::from_timestamp(row.created, 0).unwrap_or_default(),
            })
            .collect())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let path = format!("/containers/{}/stats?stream=false", id);
        let stats: StatsResponse = self.call_json(Method::GET, &path, None).await?;
        Ok(stats.into())
    }

    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        if spec.command.is_empty() {
            return Err(RuntimeError::InvalidRequest("exec command is empty".into()));
        }

        let mut body = serde_json::json!({
            "AttachStdin": false,
            "AttachStdout": spec.attach_stdout,
            "AttachStderr": spec.attach_stderr,
            "Tty": false,
            "Cmd": spec.command,
            "Env": spec.env,
        });
        if let Some(user) = &spec.user {
            body["User"] = user.clone().into();
        }
        if let Some(dir) = &spec.working_dir {
            body["WorkingDir"] = dir.clone().into();
        }

        let path = format!("/containers/{}/exec", container_id);
        let created: CreatedResponse = self.call_json(Method::POST, &path, Some(body)).await?;
        tracing::trace!(container_id, exec_id = %created.id, "Exec created");
        Ok(created.id)
    }

    async fn exec_start(&self, exec_id: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let path = format!("/exec/{}/start", exec_id);
        let body = serde_json::json!({ "Detach": false, "Tty": false });
        let response = self.call(Method::POST, &path, Some(body), &[]).await?;

        Ok(response
            .into_body()
            .map_err(|e| RuntimeError::Stream(e.to_string()))
            .boxed())
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect> {
        let path = format!("/exec/{}/json", exec_id);
        let inspect: ExecInspectResponse = self.call_json(Method::GET, &path, None).await?;
        Ok(ExecInspect {
            exit_code: inspect.exit_code,
            running: inspect.running,
        })
    }
}

// Engine response shapes

#[derive(Debug, Deserialize)]
struct EngineMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PullProgress {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerRow {
    id: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    created: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspectResponse {
    exit_code: Option<i64>,
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    cpu_stats: CpuStats,
    #[serde(default)]
    precpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
}

#[derive(Debug, Default, Deserialize)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: CpuUsage,
    #[serde(default)]
    system_cpu_usage: u64,
    #[serde(default)]
    online_cpus: u32,
}

#[derive(Debug, Default, Deserialize)]
struct CpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    limit: u64,
}

impl From<StatsResponse> for ContainerStats {
    fn from(stats: StatsResponse) -> Self {
        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .saturating_sub(stats.precpu_stats.system_cpu_usage) as f64;
        let cpus = stats.cpu_stats.online_cpus.max(1) as f64;

        let cpu_percent = if system_delta > 0.0 {
            cpu_delta / system_delta * cpus * 100.0
        } else {
            0.0
        };

        Self {
            cpu_percent,
            memory_bytes: stats.memory_stats.usage,
            memory_limit_bytes: stats.memory_stats.limit,
        }
    }
}
