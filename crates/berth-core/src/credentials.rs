//! Credentials file inside a sandbox.
//!
//! The file is written through exec, so it works the same on every backend.

use crate::error::{CoreError, Result};
use crate::sandbox::{ExecOptions, Sandbox};
use base64::Engine as _;
use serde::Serialize;

/// Where agents look for their credentials.
pub const CREDENTIALS_PATH: &str = "/home/agent/.config/berth/credentials.json";

/// Carries the base64 payload, so it never shows up in the process argv.
const PAYLOAD_VAR: &str = "BERTH_CREDENTIALS_B64";

// $0 is the target path.
const WRITE_SCRIPT: &str = r#"umask 077 && mkdir -p "$(dirname "$0")" \
    && printf %s "$BERTH_CREDENTIALS_B64" | base64 -d > "$0" && chmod 600 "$0""#;

/// Writes and checks the credentials file of a sandbox.
#[derive(Debug, Clone)]
pub struct CredentialsInjector {
    path: String,
}

impl Default for CredentialsInjector {
    fn default() -> Self {
        Self::new(CREDENTIALS_PATH)
    }
}

impl CredentialsInjector {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Serialize `credentials` as JSON and write them with mode 0600.
    ///
    /// The payload travels in the exec environment. On the cluster backend
    /// the environment is applied through `env`, whose argv briefly holds it.
    pub async fn inject<T: Serialize>(&self, sandbox: &Sandbox, credentials: &T) -> Result<()> {
        let json = serde_json::to_vec(credentials)
            .map_err(|e| CoreError::CredentialsInjectionFailed(e.to_string()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);

        let options = ExecOptions::new(["sh", "-c", WRITE_SCRIPT, self.path.as_str()])
            .env(PAYLOAD_VAR, encoded);
        let result = sandbox
            .exec_with(options)
            .await
            .map_err(|e| CoreError::CredentialsInjectionFailed(e.to_string()))?;
        if !result.success() {
            return Err(CoreError::CredentialsInjectionFailed(format!(
                "writing {} exited with {}: {}",
                self.path, result.exit_code, result.stderr
            )));
        }

        tracing::info!(sandbox_id = %sandbox.id(), path = %self.path, "Credentials injected");
        Ok(())
    }

    /// Check the credentials file exists.
    pub async fn verify(&self, sandbox: &Sandbox) -> Result<()> {
        let args = ["-f", self.path.as_str()];
        let result = sandbox.exec("test", &args, false).await?;
        if result.success() {
            Ok(())
        } else {
            Err(CoreError::CredentialsNotFound(self.path.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::fakes::{FakeContainerRuntime, FakeReply};
    use crate::provider::{ProviderConfig, SandboxProvider};
    use crate::{DockerBackend, DockerBackendConfig};
    use std::sync::Arc;

    async fn sandbox(runtime: &Arc<FakeContainerRuntime>) -> Arc<Sandbox> {
        let backend = DockerBackend::new(runtime.clone(), DockerBackendConfig::default());
        let provider = SandboxProvider::new(Arc::new(backend), ProviderConfig::default());
        let config = SandboxConfig::builder()
            .project_id("proj-a")
            .image("berth/agent:latest")
            .build()
            .unwrap();
        provider.create(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_inject_writes_encoded_json() {
        let runtime = Arc::new(FakeContainerRuntime::new());
        let sandbox = sandbox(&runtime).await;

        let creds = serde_json::json!({"token": "s3cret"});
        CredentialsInjector::default()
            .inject(&sandbox, &creds)
            .await
            .unwrap();

        let spec = runtime.last_exec_spec().unwrap();
        assert_eq!(spec.command[..2], ["sh", "-c"]);
        assert!(spec.command[2].contains("chmod 600"));
        assert_eq!(spec.command[3..], [CREDENTIALS_PATH]);
        assert!(spec.command.iter().all(|arg| !arg.contains("s3cret")));

        let entry = spec
            .env
            .iter()
            .find_map(|e| e.strip_prefix("BERTH_CREDENTIALS_B64="))
            .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(entry)
            .unwrap();
        let written: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(written, creds);
    }

    #[tokio::test]
    async fn test_inject_failure() {
        let runtime = Arc::new(FakeContainerRuntime::new());
        let sandbox = sandbox(&runtime).await;
        runtime.respond_with(|_| FakeReply::fail(1, "read-only file system"));

        let err = CredentialsInjector::default()
            .inject(&sandbox, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::CredentialsInjectionFailed(ref m) if m.contains("read-only")
        ));
    }

    #[tokio::test]
    async fn test_verify() {
        let runtime = Arc::new(FakeContainerRuntime::new());
        let sandbox = sandbox(&runtime).await;
        let injector = CredentialsInjector::new("/tmp/creds.json");

        injector.verify(&sandbox).await.unwrap();
        assert_eq!(
            runtime.last_exec_spec().unwrap().command,
            vec!["test", "-f", "/tmp/creds.json"]
        );

        runtime.respond_with(|_| FakeReply::fail(1, ""));
        let err = injector.verify(&sandbox).await.unwrap_err();
        assert!(matches!(err, CoreError::CredentialsNotFound(ref p) if p == "/tmp/creds.json"));
    }
}
