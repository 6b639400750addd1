//! Backend seam between the provider and a concrete runtime.

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::{ExecOptions, SandboxId, SandboxMetrics};
use async_trait::async_trait;
use berth_runtime::ExecOutput;
use chrono::{DateTime, Utc};

/// A runtime unit allocated for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    /// Container id or pod name.
    pub handle: String,
    /// True if the unit was handed out by the warm pool.
    pub pooled: bool,
}

/// A labeled unit found on the runtime at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSandbox {
    /// Sandbox id from the unit's labels.
    pub id: SandboxId,
    /// Project id from the unit's labels.
    pub project_id: String,
    /// Container id or pod name.
    pub handle: String,
    /// True if the unit is running.
    pub running: bool,
    /// When the unit was created.
    pub created_at: DateTime<Utc>,
}

/// What a [`SandboxProvider`](crate::SandboxProvider) needs from a runtime.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name, e.g. `docker`.
    fn name(&self) -> &'static str;

    /// Allocate a runtime unit for a new sandbox.
    async fn create_unit(&self, id: SandboxId, config: &SandboxConfig) -> Result<UnitHandle>;

    /// Start an allocated unit and wait until it accepts commands.
    async fn start_unit(&self, unit: &UnitHandle, config: &SandboxConfig) -> Result<()>;

    /// Tear a unit down. A unit that is already gone counts as destroyed.
    async fn destroy_unit(&self, handle: &str) -> Result<()>;

    /// Start a command in a unit.
    async fn exec(&self, handle: &str, options: &ExecOptions) -> Result<ExecOutput>;

    /// Sample a unit's resource usage.
    async fn metrics(&self, handle: &str) -> Result<SandboxMetrics>;

    /// List labeled units that host sandboxes.
    async fn discover(&self) -> Result<Vec<DiscoveredSandbox>>;
}
