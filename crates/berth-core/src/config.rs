//! Sandbox configuration types.

use crate::error::CoreError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Host directory mounted into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Path on the host.
    pub host_path: PathBuf,
    /// Path inside the sandbox.
    pub container_path: String,
    /// Mount read-only.
    pub readonly: bool,
}

/// Configuration for creating a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Project the sandbox belongs to.
    pub project_id: String,
    /// Host directory mounted as the sandbox workspace.
    pub project_path: Option<PathBuf>,
    /// Image to run.
    pub image: String,
    /// Memory in MB (default: 2048).
    pub memory_mb: u64,
    /// CPU cores (default: 2.0).
    pub cpu_cores: f64,
    /// Minutes of inactivity after which an external reaper may evict the
    /// sandbox (default: 30).
    pub idle_timeout_minutes: u32,
    /// Additional host mounts.
    pub volume_mounts: Vec<VolumeMount>,
    /// Environment for the sandbox and every exec in it.
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            project_path: None,
            image: String::new(),
            memory_mb: 2048,
            cpu_cores: 2.0,
            idle_timeout_minutes: 30,
            volume_mounts: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.project_id.trim().is_empty() {
            return Err(CoreError::InvalidConfig("project_id is required".into()));
        }
        if self.image.trim().is_empty() {
            return Err(CoreError::InvalidConfig("image is required".into()));
        }
        if self.memory_mb == 0 {
            return Err(CoreError::InvalidConfig("memory_mb must be > 0".into()));
        }
        if !(self.cpu_cores > 0.0) {
            return Err(CoreError::InvalidConfig("cpu_cores must be > 0".into()));
        }
        for mount in &self.volume_mounts {
            if !mount.container_path.starts_with('/') {
                return Err(CoreError::InvalidConfig(format!(
                    "container_path must be absolute: {}",
                    mount.container_path
                )));
            }
        }
        Ok(())
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.idle_timeout_minutes) * 60)
    }

    /// Environment in `KEY=value` form.
    pub fn env_entries(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the project id.
    pub fn project_id(mut self, id: impl Into<String>) -> Self {
        self.config.project_id = id.into();
        self
    }

    /// Set the host directory mounted as the workspace.
    pub fn project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.project_path = Some(path.into());
        self
    }

    /// Set the image.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Set memory in MB.
    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.config.memory_mb = mb;
        self
    }

    /// Set CPU cores.
    pub fn cpu_cores(mut self, cores: f64) -> Self {
        self.config.cpu_cores = cores;
        self
    }

    /// Set the idle timeout in minutes.
    pub fn idle_timeout_minutes(mut self, minutes: u32) -> Self {
        self.config.idle_timeout_minutes = minutes;
        self
    }

    /// Add a host mount.
    pub fn volume(
        mut self,
        host_path: impl Into<PathBuf>,
        container_path: impl Into<String>,
        readonly: bool,
    ) -> Self {
        self.config.volume_mounts.push(VolumeMount {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly,
        });
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
