//! Single-host backend on the Docker Engine.

use crate::backend::{DiscoveredSandbox, SandboxBackend, UnitHandle};
use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::labels::{Labels, DEFAULT_LABEL_PREFIX};
use crate::sandbox::{ExecOptions, SandboxId, SandboxMetrics};
use async_trait::async_trait;
use berth_runtime::{
    demux_stream, ContainerRuntime, ContainerSpec, DockerEngine, ExecOutput, ExecSpec,
    RuntimeError, DEFAULT_DOCKER_SOCKET,
};
use futures::FutureExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for [`DockerBackend`].
#[derive(Debug, Clone)]
pub struct DockerBackendConfig {
    /// Engine socket (default: `/var/run/docker.sock`).
    pub socket_path: PathBuf,
    /// Label namespace (default: `berth.dev`).
    pub label_prefix: String,
    /// Where `project_path` is mounted (default: `/workspace`).
    pub workspace_path: String,
    /// User for non-root execs (default: `agent`). `None` uses the image user.
    pub exec_user: Option<String>,
    /// Command that keeps the container alive (default: `sleep infinity`).
    pub keep_alive_command: Vec<String>,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            workspace_path: "/workspace".to_string(),
            exec_user: Some("agent".to_string()),
            keep_alive_command: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }
}

/// [`SandboxBackend`] that runs each sandbox in a Docker container.
pub struct DockerBackend {
    runtime: Arc<dyn ContainerRuntime>,
    config: DockerBackendConfig,
    labels: Labels,
}

impl DockerBackend {
    /// Backend over any container runtime.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: DockerBackendConfig) -> Self {
        let labels = Labels::new(config.label_prefix.clone());
        Self {
            runtime,
            config,
            labels,
        }
    }

    /// Backend talking to the Engine at `config.socket_path`.
    pub fn connect(config: DockerBackendConfig) -> Self {
        let engine = DockerEngine::new(config.socket_path.clone());
        Self::new(Arc::new(engine), config)
    }

    /// Backend configuration.
    pub fn config(&self) -> &DockerBackendConfig {
        &self.config
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        self.runtime
            .pull_image(image)
            .await
            .map_err(|e| CoreError::ImagePullFailed {
                image: image.to_string(),
                message: e.to_string(),
            })
    }

    fn container_spec(&self, id: SandboxId, config: &SandboxConfig) -> ContainerSpec {
        let labels = HashMap::from([
            (self.labels.sandbox(), "true".to_string()),
            (self.labels.project_id(), config.project_id.clone()),
            (self.labels.sandbox_id(), id.to_string()),
        ]);

        let mut binds = Vec::with_capacity(config.volume_mounts.len() + 1);
        if let Some(path) = &config.project_path {
            binds.push(format!(
                "{}:{}:rw",
                path.display(),
                self.config.workspace_path
            ));
        }
        for mount in &config.volume_mounts {
            let mode = if mount.readonly { "ro" } else { "rw" };
            binds.push(format!(
                "{}:{}:{}",
                mount.host_path.display(),
                mount.container_path,
                mode
            ));
        }

        ContainerSpec {
            name: Some(format!("berth-{id}")),
            image: config.image.clone(),
            command: self.config.keep_alive_command.clone(),
            env: config.env_entries(),
            labels,
            binds,
            memory_bytes: i64::try_from(config.memory_mb.saturating_mul(1024 * 1024)).ok(),
            nano_cpus: Some((config.cpu_cores * 1e9) as i64),
            working_dir: config
                .project_path
                .as_ref()
                .map(|_| self.config.workspace_path.clone()),
        }
    }
}

/// Exec failures on a missing container are `ContainerNotFound`, the rest
/// `ExecFailed`.
fn exec_error(handle: &str, err: RuntimeError) -> CoreError {
    if err.is_not_found() {
        CoreError::ContainerNotFound(handle.to_string())
    } else {
        CoreError::ExecFailed(err.to_string())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_unit(&self, id: SandboxId, config: &SandboxConfig) -> Result<UnitHandle> {
        self.ensure_image(&config.image).await?;

        let spec = self.container_spec(id, config);
        let container_id = self.runtime.create_container(&spec).await?;
        tracing::info!(
            sandbox_id = %id,
            project_id = %config.project_id,
            container_id = %container_id,
            "Container created"
        );

        Ok(UnitHandle {
            handle: container_id,
            pooled: false,
        })
    }

    async fn start_unit(&self, unit: &UnitHandle, _config: &SandboxConfig) -> Result<()> {
        self.runtime
            .start_container(&unit.handle)
            .await
            .map_err(|e| CoreError::from_unit(&unit.handle, e))
    }

    async fn destroy_unit(&self, handle: &str) -> Result<()> {
        for result in [
            self.runtime.stop_container(handle).await,
            self.runtime.remove_container(handle).await,
        ] {
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(container_id = handle, "Container already gone");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(container_id = handle, "Container removed");
        Ok(())
    }

    async fn exec(&self, handle: &str, options: &ExecOptions) -> Result<ExecOutput> {
        let user = if options.as_root {
            Some("root".to_string())
        } else {
            self.config.exec_user.clone()
        };
        let spec = ExecSpec {
            user,
            env: options.env_entries(),
            working_dir: options.working_dir.clone(),
            ..ExecSpec::new(options.command.clone())
        };

        let exec_id = self
            .runtime
            .exec_create(handle, &spec)
            .await
            .map_err(|e| exec_error(handle, e))?;
        let raw = self
            .runtime
            .exec_start(&exec_id)
            .await
            .map_err(|e| exec_error(handle, e))?;

        let runtime = Arc::clone(&self.runtime);
        let exit_code = async move {
            runtime
                .exec_inspect(&exec_id)
                .await
                .map(|inspect| inspect.exit_code)
        }
        .boxed();

        Ok(ExecOutput {
            chunks: demux_stream(raw),
            exit_code,
        })
    }

    async fn metrics(&self, handle: &str) -> Result<SandboxMetrics> {
        let stats = self
            .runtime
            .container_stats(handle)
            .await
            .map_err(|e| CoreError::from_unit(handle, e))?;
        Ok(SandboxMetrics {
            cpu_percent: stats.cpu_percent,
            memory_bytes: stats.memory_bytes,
            memory_limit_bytes: stats.memory_limit_bytes,
        })
    }

    async fn discover(&self) -> Result<Vec<DiscoveredSandbox>> {
        let filters = [
            format!("{}=true", self.labels.sandbox()),
            self.labels.sandbox_id(),
        ];
        let containers = self.runtime.list_containers(&filters).await?;

        let mut found = Vec::with_capacity(containers.len());
        for container in containers {
            let id = container
                .labels
                .get(&self.labels.sandbox_id())
                .and_then(|v| v.parse::<SandboxId>().ok());
            let project_id = container.labels.get(&self.labels.project_id());
            let (Some(id), Some(project_id)) = (id, project_id) else {
                tracing::warn!(
                    container_id = %container.id,
                    "Skipping container with malformed labels"
                );
                continue;
            };
            found.push(DiscoveredSandbox {
                id,
                project_id: project_id.clone(),
                running: container.is_running(),
                handle: container.id,
                created_at: container.created_at,
            });
        }
        Ok(found)
    }
}
