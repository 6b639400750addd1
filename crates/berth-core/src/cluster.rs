//! Cluster backend: one Kubernetes pod per sandbox.

use crate::audit::{AuditEventType, AuditRecord};
use crate::backend::{DiscoveredSandbox, SandboxBackend, UnitHandle};
use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::labels::{Labels, DEFAULT_LABEL_PREFIX};
use crate::pool::WarmPool;
use crate::sandbox::{collect_output, ExecOptions, SandboxId, SandboxMetrics};
use async_trait::async_trait;
use berth_runtime::{
    ExecOutput, ExecSpec, HostMount, PodRuntime, PodSnapshot, PodTemplate, RuntimeError,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for [`ClusterBackend`].
#[derive(Debug, Clone)]
pub struct ClusterBackendConfig {
    /// Namespace sandbox pods live in (default: `default`).
    pub namespace: String,
    /// Label namespace (default: `berth.dev`).
    pub label_prefix: String,
    /// How long a new pod may take to reach `Running` (default: 120s).
    pub pod_ready_timeout: Duration,
    /// Poll interval while waiting for a pod (default: 1s).
    pub pod_poll_interval: Duration,
    /// Service account for sandbox pods.
    pub service_account: Option<String>,
    /// Labels added to every sandbox pod.
    pub extra_labels: BTreeMap<String, String>,
    /// Where `project_path` is mounted (default: `/workspace`).
    pub workspace_path: String,
    /// Command that keeps the pod alive (default: `sleep infinity`).
    pub keep_alive_command: Vec<String>,
}

impl Default for ClusterBackendConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            pod_ready_timeout: Duration::from_secs(120),
            pod_poll_interval: Duration::from_secs(1),
            service_account: None,
            extra_labels: BTreeMap::new(),
            workspace_path: "/workspace".to_string(),
            keep_alive_command: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }
}

/// [`SandboxBackend`] that runs each sandbox in a pod, preferring pods
/// from a [`WarmPool`] when one is attached.
pub struct ClusterBackend {
    pods: Arc<dyn PodRuntime>,
    pool: Option<Arc<WarmPool>>,
    config: ClusterBackendConfig,
    labels: Labels,
}

impl ClusterBackend {
    /// Backend creating every pod on demand.
    pub fn new(pods: Arc<dyn PodRuntime>, config: ClusterBackendConfig) -> Self {
        let labels = Labels::new(config.label_prefix.clone());
        Self {
            pods,
            pool: None,
            config,
            labels,
        }
    }

    /// Take pods from `pool` before creating new ones.
    pub fn with_pool(mut self, pool: Arc<WarmPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// The attached warm pool.
    pub fn pool(&self) -> Option<&Arc<WarmPool>> {
        self.pool.as_ref()
    }

    /// Warm pool pod nobody has claimed yet.
    fn is_idle_pool_pod(&self, pod: &PodSnapshot) -> bool {
        pod.label(&self.labels.warm_pool()).is_some()
            && pod.label(&self.labels.sandbox_id()).is_none()
    }

    fn audit(&self, event: AuditEventType, pod: &str) -> AuditRecord {
        AuditRecord::new(event, pod).namespace(&self.config.namespace)
    }

    fn pod_template(&self, id: SandboxId, config: &SandboxConfig) -> PodTemplate {
        let mut labels = self.config.extra_labels.clone();
        labels.extend([
            (self.labels.sandbox(), "true".to_string()),
            (self.labels.project_id(), config.project_id.clone()),
            (self.labels.sandbox_id(), id.to_string()),
        ]);

        let mut mounts = Vec::with_capacity(config.volume_mounts.len() + 1);
        if let Some(path) = &config.project_path {
            mounts.push(HostMount {
                host_path: path.display().to_string(),
                container_path: self.config.workspace_path.clone(),
                read_only: false,
            });
        }
        mounts.extend(config.volume_mounts.iter().map(|m| HostMount {
            host_path: m.host_path.display().to_string(),
            container_path: m.container_path.clone(),
            read_only: m.readonly,
        }));

        PodTemplate {
            name: format!("berth-{id}"),
            image: config.image.clone(),
            command: self.config.keep_alive_command.clone(),
            env: config.env.clone(),
            labels,
            cpu: Some(format!("{}m", (config.cpu_cores * 1000.0).round() as u64)),
            memory: Some(format!("{}Mi", config.memory_mb)),
            service_account: self.config.service_account.clone(),
            mounts,
            working_dir: config
                .project_path
                .as_ref()
                .map(|_| self.config.workspace_path.clone()),
        }
    }

    /// Wait for a pod to run, bounded by `pod_ready_timeout`.
    async fn wait_ready(&self, name: &str, image: &str) -> Result<()> {
        let start = std::time::Instant::now();
        match tokio::time::timeout(self.config.pod_ready_timeout, self.poll_ready(name, image))
            .await
        {
            Ok(Ok(())) => {
                tracing::debug!(
                    pod = name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Pod ready"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Kube(format!(
                "pod {name} not ready after {:?}",
                self.config.pod_ready_timeout
            ))
            .into()),
        }
    }

    async fn poll_ready(&self, name: &str, image: &str) -> Result<()> {
        loop {
            let Some(pod) = self.pods.get_pod(name).await? else {
                return Err(CoreError::ContainerNotFound(name.to_string()));
            };
            if pod.is_running() {
                return Ok(());
            }
            if pod.is_image_pull_failure() {
                return Err(CoreError::ImagePullFailed {
                    image: image.to_string(),
                    message: pod.waiting_reason.unwrap_or_default(),
                });
            }
            if pod.is_terminated() {
                return Err(RuntimeError::Kube(format!(
                    "pod {name} terminated before becoming ready (phase {})",
                    pod.phase.as_deref().unwrap_or("unknown")
                ))
                .into());
            }
            tokio::time::sleep(self.config.pod_poll_interval).await;
        }
    }

    async fn claim_warm(&self, id: SandboxId, config: &SandboxConfig) -> Option<String> {
        let pool = self.pool.as_ref()?;
        let pod = pool.get_warm(&config.project_id).await?;

        let labels = BTreeMap::from([(self.labels.sandbox_id(), id.to_string())]);
        match self.pods.patch_labels(&pod, None, &labels).await {
            Ok(_) => Some(pod),
            Err(e) => {
                tracing::warn!(pod = %pod, error = %e, "Failed to label warm pod, releasing it");
                if let Err(e) = pool.release(&pod).await {
                    tracing::warn!(pod = %pod, error = %e, "Failed to release warm pod");
                }
                None
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for ClusterBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn create_unit(&self, id: SandboxId, config: &SandboxConfig) -> Result<UnitHandle> {
        if let Some(pod) = self.claim_warm(id, config).await {
            tracing::info!(
                sandbox_id = %id,
                project_id = %config.project_id,
                pod = %pod,
                "Using warm pod"
            );
            return Ok(UnitHandle {
                handle: pod,
                pooled: true,
            });
        }

        let template = self.pod_template(id, config);
        match self.pods.create_pod(&template).await {
            Ok(pod) => {
                self.audit(AuditEventType::PodCreated, &pod.name)
                    .project(&config.project_id)
                    .sandbox(id)
                    .detail("image", config.image.as_str())
                    .emit();
                tracing::info!(
                    sandbox_id = %id,
                    project_id = %config.project_id,
                    pod = %pod.name,
                    "Pod created"
                );
                Ok(UnitHandle {
                    handle: pod.name,
                    pooled: false,
                })
            }
            Err(e) => {
                self.audit(AuditEventType::PodCreateFailed, &template.name)
                    .project(&config.project_id)
                    .sandbox(id)
                    .failed(&e)
                    .emit();
                Err(e.into())
            }
        }
    }

    async fn start_unit(&self, unit: &UnitHandle, config: &SandboxConfig) -> Result<()> {
        // Pods start on creation.
        self.wait_ready(&unit.handle, &config.image).await
    }

    async fn destroy_unit(&self, handle: &str) -> Result<()> {
        if let Some(pool) = &self.pool {
            if pool.tracks(handle).await {
                return pool.release(handle).await;
            }
        }

        match self.pods.delete_pod(handle).await {
            Ok(()) => {
                self.audit(AuditEventType::PodDeleted, handle).emit();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(pod = handle, "Pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, handle: &str, options: &ExecOptions) -> Result<ExecOutput> {
        let spec = ExecSpec {
            user: options.as_root.then(|| "root".to_string()),
            env: options.env_entries(),
            working_dir: options.working_dir.clone(),
            ..ExecSpec::new(options.command.clone())
        };

        self.pods.exec(handle, &spec).await.map_err(|e| {
            if e.is_not_found() {
                CoreError::ContainerNotFound(handle.to_string())
            } else {
                CoreError::ExecFailed(e.to_string())
            }
        })
    }

    /// Reads the pod's cgroup v2 memory counters. CPU is not sampled.
    async fn metrics(&self, handle: &str) -> Result<SandboxMetrics> {
        let options = ExecOptions::new([
            "cat",
            "/sys/fs/cgroup/memory.current",
            "/sys/fs/cgroup/memory.max",
        ]);
        let result = collect_output(self.exec(handle, &options).await?).await?;
        if !result.success() {
            return Err(CoreError::ExecFailed(result.stderr));
        }

        let mut values = result.stdout.lines().map(|l| l.trim().parse::<u64>().ok());
        Ok(SandboxMetrics {
            cpu_percent: 0.0,
            memory_bytes: values.next().flatten().unwrap_or(0),
            // "max" means unlimited
            memory_limit_bytes: values.next().flatten().unwrap_or(0),
        })
    }

    async fn discover(&self) -> Result<Vec<DiscoveredSandbox>> {
        let pods = self.pods.list_pods(&self.labels.sandbox_selector()).await?;

        let mut found = Vec::with_capacity(pods.len());
        for pod in pods {
            let id = pod
                .label(&self.labels.sandbox_id())
                .and_then(|v| v.parse::<SandboxId>().ok());
            let project_id = pod.label(&self.labels.project_id());
            let (Some(id), Some(project_id)) = (id, project_id) else {
                if self.is_idle_pool_pod(&pod) {
                    tracing::debug!(pod = %pod.name, "Skipping unallocated warm pod");
                } else {
                    tracing::warn!(pod = %pod.name, "Skipping pod with malformed labels");
                }
                continue;
            };
            found.push(DiscoveredSandbox {
                id,
                project_id: project_id.to_string(),
                running: pod.is_running(),
                created_at: pod.created_at.unwrap_or_else(Utc::now),
                handle: pod.name,
            });
        }
        Ok(found)
    }
}
