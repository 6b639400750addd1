//! [`PodRuntime`] implementation on the Kubernetes API.

use crate::error::{Result, RuntimeError};
use crate::exec::{ExecOutput, ExecSpec, OutputChunk, StreamKind};
use crate::pods::{wrap_pod_command, PodRuntime, PodSnapshot, PodTemplate};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

/// Read size for pod exec output.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Pods in one namespace.
#[derive(Clone)]
pub struct KubePods {
    api: Api<Pod>,
    namespace: String,
    container: Option<String>,
}

impl KubePods {
    /// Wrap an existing client.
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            container: None,
        }
    }

    /// Connect using the in-cluster or kubeconfig defaults.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = kube::Client::try_default().await?;
        tracing::info!(namespace, "Connected to Kubernetes API");
        Ok(Self::new(client, namespace))
    }

    /// Target a named container for exec instead of the pod's first one.
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Namespace the pods live in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn snapshot(pod: Pod) -> PodSnapshot {
    let status = pod.status.unwrap_or_default();
    let waiting_reason = status
        .container_statuses
        .unwrap_or_default()
        .into_iter()
        .filter_map(|c| c.state.and_then(|s| s.waiting).and_then(|w| w.reason))
        .next();

    PodSnapshot {
        name: pod.metadata.name.unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
        phase: status.phase,
        resource_version: pod.metadata.resource_version,
        created_at: pod.metadata.creation_timestamp.map(|t| t.0),
        deleting: pod.metadata.deletion_timestamp.is_some(),
        waiting_reason,
    }
}

fn pod_manifest(template: &PodTemplate) -> Result<Pod> {
    let env: Vec<serde_json::Value> = template
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut limits = serde_json::Map::new();
    if let Some(cpu) = &template.cpu {
        limits.insert("cpu".into(), cpu.clone().into());
    }
    if let Some(memory) = &template.memory {
        limits.insert("memory".into(), memory.clone().into());
    }

    let volumes: Vec<serde_json::Value> = template
        .mounts
        .iter()
        .enumerate()
        .map(|(i, m)| {
            json!({
                "name": format!("mount-{i}"),
                "hostPath": { "path": m.host_path },
            })
        })
        .collect();
    let volume_mounts: Vec<serde_json::Value> = template
        .mounts
        .iter()
        .enumerate()
        .map(|(i, m)| {
            json!({
                "name": format!("mount-{i}"),
                "mountPath": m.container_path,
                "readOnly": m.read_only,
            })
        })
        .collect();

    let mut container = json!({
        "name": "sandbox",
        "image": template.image,
        "env": env,
        "resources": { "limits": limits, "requests": limits },
        "volumeMounts": volume_mounts,
    });
    if !template.command.is_empty() {
        container["command"] = json!(template.command);
    }
    if let Some(dir) = &template.working_dir {
        container["workingDir"] = dir.clone().into();
    }

    let mut spec = json!({
        "restartPolicy": "Never",
        "containers": [container],
        "volumes": volumes,
    });
    if let Some(account) = &template.service_account {
        spec["serviceAccountName"] = account.clone().into();
    }

    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": template.name, "labels": template.labels },
        "spec": spec,
    });
    Ok(serde_json::from_value(manifest)?)
}

/// Exit code carried by the final status of a pod exec.
fn exit_code_from_status(status: Option<Status>) -> Result<Option<i64>> {
    let Some(status) = status else {
        return Ok(None);
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(Some(0));
    }

    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse::<i64>().ok());

    match code {
        Some(code) => Ok(Some(code)),
        None => Err(RuntimeError::Stream(
            status.message.unwrap_or_else(|| "exec failed".into()),
        )),
    }
}

async fn pump<R>(
    reader: Option<R>,
    kind: StreamKind,
    tx: mpsc::UnboundedSender<Result<OutputChunk>>,
) where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    kind,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if tx.send(Ok(chunk)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(RuntimeError::Stream(e.to_string())));
                break;
            }
        }
    }
}

#[async_trait]
impl PodRuntime for KubePods {
    async fn list_pods(&self, selector: &str) -> Result<Vec<PodSnapshot>> {
        let params = ListParams::default().labels(selector);
        let pods = self.api.list(&params).await?;
        tracing::trace!(selector, count = pods.items.len(), "Pods listed");
        Ok(pods.items.into_iter().map(snapshot).collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodSnapshot>> {
        Ok(self.api.get_opt(name).await?.map(snapshot))
    }

    async fn create_pod(&self, template: &PodTemplate) -> Result<PodSnapshot> {
        let pod = pod_manifest(template)?;
        let created = self.api.create(&PostParams::default(), &pod).await?;
        tracing::debug!(pod = %template.name, namespace = %self.namespace, "Pod created");
        Ok(snapshot(created))
    }

    async fn patch_labels(
        &self,
        name: &str,
        resource_version: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<PodSnapshot> {
        let mut metadata = json!({ "labels": labels });
        if let Some(version) = resource_version {
            metadata["resourceVersion"] = version.into();
        }
        let patch = json!({ "metadata": metadata });

        let pod = self
            .api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(snapshot(pod))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::default()).await?;
        tracing::debug!(pod = name, namespace = %self.namespace, "Pod deletion requested");
        Ok(())
    }

    async fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput> {
        if spec.command.is_empty() {
            return Err(RuntimeError::InvalidRequest("exec command is empty".into()));
        }
        if spec.user.is_some() {
            tracing::debug!(pod = name, "Pod exec runs as the container user");
        }

        let mut params = AttachParams::default()
            .stdin(false)
            .stdout(spec.attach_stdout)
            .stderr(spec.attach_stderr);
        if let Some(container) = &self.container {
            params = params.container(container.clone());
        }

        let mut attached = self.api.exec(name, wrap_pod_command(spec), &params).await?;
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (tx, rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let pod = name.to_string();

        tokio::spawn(async move {
            tokio::join!(
                pump(stdout, StreamKind::Stdout, tx.clone()),
                pump(stderr, StreamKind::Stderr, tx)
            );
            let exit = match status {
                Some(status) => exit_code_from_status(status.await),
                None => Ok(None),
            };
            if let Err(e) = attached.join().await {
                tracing::debug!(pod = %pod, error = %e, "Pod exec connection closed with error");
            }
            let _ = exit_tx.send(exit);
        });

        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let exit_code = async move {
            exit_rx
                .await
                .map_err(|_| RuntimeError::Stream("exec status lost".into()))?
        }
        .boxed();

        Ok(ExecOutput { chunks, exit_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pods::HostMount;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    #[test]
    fn test_exit_code_success() {
        let status = Status {
            status: Some("Success".into()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(status)).unwrap(), Some(0));
    }

    #[test]
    fn test_exit_code_from_cause() {
        let status = Status {
            status: Some("Failure".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("127".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(status)).unwrap(), Some(127));
    }

    #[test]
    fn test_exit_code_failure_without_code() {
        let status = Status {
            status: Some("Failure".into()),
            message: Some("container not found".into()),
            ..Default::default()
        };
        assert!(matches!(
            exit_code_from_status(Some(status)),
            Err(RuntimeError::Stream(msg)) if msg == "container not found"
        ));
    }

    #[test]
    fn test_exit_code_missing_status() {
        assert_eq!(exit_code_from_status(None).unwrap(), None);
    }

    #[test]
    fn test_pod_manifest() {
        let template = PodTemplate {
            name: "berth-pool-abc".into(),
            image: "berth/agent:latest".into(),
            command: vec!["sleep".into(), "infinity".into()],
            labels: BTreeMap::from([("berth.dev/warm-pool".into(), "true".into())]),
            cpu: Some("2".into()),
            memory: Some("2048Mi".into()),
            mounts: vec![HostMount {
                host_path: "/srv/projects/a".into(),
                container_path: "/workspace".into(),
                read_only: false,
            }],
            ..Default::default()
        };

        let pod = pod_manifest(&template).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("berth-pool-abc"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("berth/agent:latest"));
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/workspace");
        assert_eq!(spec.volumes.unwrap().len(), 1);
    }
}
