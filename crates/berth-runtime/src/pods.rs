//! Pod runtime abstraction used by the cluster backend and the warm pool.

use crate::error::Result;
use crate::exec::{ExecOutput, ExecSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Host directory mounted into a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMount {
    /// Path on the node.
    pub host_path: String,
    /// Path inside the container.
    pub container_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Everything needed to create one sandbox pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodTemplate {
    /// Pod name, unique in the namespace.
    pub name: String,
    /// Container image.
    pub image: String,
    /// Container command, empty for the image default.
    pub command: Vec<String>,
    /// Container environment.
    pub env: BTreeMap<String, String>,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
    /// CPU limit in Kubernetes quantity form (`"2"`, `"500m"`).
    pub cpu: Option<String>,
    /// Memory limit in Kubernetes quantity form (`"2048Mi"`).
    pub memory: Option<String>,
    /// Service account the pod runs as.
    pub service_account: Option<String>,
    /// Host directories to mount.
    pub mounts: Vec<HostMount>,
    /// Working directory of the container.
    pub working_dir: Option<String>,
}

/// Point-in-time view of a pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodSnapshot {
    /// Pod name.
    pub name: String,
    /// Pod labels.
    pub labels: BTreeMap<String, String>,
    /// Pod phase (`Pending`, `Running`, `Succeeded`, `Failed`, `Unknown`).
    pub phase: Option<String>,
    /// Optimistic-concurrency token of this version of the object.
    pub resource_version: Option<String>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// True once deletion has been requested.
    pub deleting: bool,
    /// Reason the first waiting container is waiting, e.g. `ImagePullBackOff`.
    pub waiting_reason: Option<String>,
}

impl PodSnapshot {
    /// Value of a label.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// True if the pod is running and not being deleted.
    pub fn is_running(&self) -> bool {
        !self.deleting && self.phase.as_deref() == Some("Running")
    }

    /// True if the pod will never run again.
    pub fn is_terminated(&self) -> bool {
        self.deleting || matches!(self.phase.as_deref(), Some("Succeeded" | "Failed"))
    }

    /// True if a container is stuck pulling its image.
    pub fn is_image_pull_failure(&self) -> bool {
        matches!(
            self.waiting_reason.as_deref(),
            Some("ErrImagePull" | "ImagePullBackOff" | "InvalidImageName")
        )
    }
}

/// Operations the sandbox core needs from a cluster scheduler.
#[async_trait]
pub trait PodRuntime: Send + Sync {
    /// List pods matching a label selector (`a=b,c=d`).
    async fn list_pods(&self, selector: &str) -> Result<Vec<PodSnapshot>>;

    /// Fetch one pod, `None` if it does not exist.
    async fn get_pod(&self, name: &str) -> Result<Option<PodSnapshot>>;

    /// Create a pod from a template.
    async fn create_pod(&self, template: &PodTemplate) -> Result<PodSnapshot>;

    /// Merge `labels` into a pod's labels.
    ///
    /// When `resource_version` is given the write only succeeds if the pod
    /// is still at that version; otherwise the runtime answers with a
    /// conflict (see [`RuntimeError::is_conflict`](crate::RuntimeError::is_conflict)).
    async fn patch_labels(
        &self,
        name: &str,
        resource_version: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<PodSnapshot>;

    /// Delete a pod.
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Run a command in the pod's sandbox container.
    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput>;
}

/// Build the argv for a pod exec.
///
/// The pod exec subresource has no environment or working-directory fields,
/// so both are applied by wrapping the command.
pub fn wrap_pod_command(spec: &ExecSpec) -> Vec<String> {
    let mut argv = Vec::with_capacity(spec.command.len() + spec.env.len() + 5);

    if let Some(dir) = &spec.working_dir {
        argv.extend([
            "sh".to_string(),
            "-c".to_string(),
            "cd \"$0\" && exec \"$@\"".to_string(),
            dir.clone(),
        ]);
    }
    if !spec.env.is_empty() {
        argv.push("env".to_string());
        argv.extend(spec.env.iter().cloned());
    }
    argv.extend(spec.command.iter().cloned());
    argv
}
