//! # berth-core
//!
//! Sandbox orchestration for coding agents.
//!
//! This crate provides a high-level API for creating and managing isolated
//! per-project sandboxes, backed by Docker containers on a single host or by
//! pods in a Kubernetes namespace.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       berth-core                         │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxProvider │────▶│  HashMap<SandboxId,      │    │
//! │  │   - create()    │     │          Arc<Sandbox>>   │    │
//! │  │   - get()       │     │  HashMap<project, id>    │    │
//! │  │   - stop()      │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │           │ dyn SandboxBackend                           │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  DockerBackend  │     │  ClusterBackend          │    │
//! │  │  (containers)   │     │  (pods) ──▶ WarmPool     │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │           │                          │                   │
//! │  ┌─────────────────┐                 │                   │
//! │  │  TmuxManager    │  exec on Sandbox│                   │
//! │  └─────────────────┘                 │                   │
//! └───────────┼──────────────────────────┼───────────────────┘
//!             ▼                          ▼
//!      Docker Engine API           Kubernetes API
//!        (berth-runtime)           (berth-runtime)
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use berth_core::{DockerBackend, DockerBackendConfig, ProviderConfig, SandboxConfig, SandboxProvider};
//! use std::sync::Arc;
//!
//! # async fn example() -> berth_core::Result<()> {
//! let backend = DockerBackend::connect(DockerBackendConfig::default());
//! let provider = SandboxProvider::new(Arc::new(backend), ProviderConfig::default());
//!
//! let config = SandboxConfig::builder()
//!     .project_id("proj-a")
//!     .project_path("/srv/projects/a")
//!     .image("berth/agent:latest")
//!     .memory_mb(2048)
//!     .build()?;
//!
//! let sandbox = provider.create(config).await?;
//! let result = sandbox.exec("ls", &["-la", "/workspace"], false).await?;
//! println!("{}", result.stdout);
//!
//! provider.stop(sandbox.id()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Sandbox Lifecycle**: One active sandbox per project, with lifecycle events
//! - **Command Execution**: Buffered or streamed exec with clean stdout/stderr
//! - **Tmux Sessions**: Named long-lived terminals layered on exec
//! - **Warm Pooling**: Pre-created pods handed out with an optimistic claim
//! - **Audit Records**: JSON lines for every cluster-side change

mod audit;
mod backend;
mod cluster;
mod config;
mod credentials;
mod docker;
mod error;
mod events;
mod labels;
mod pool;
mod provider;
mod sandbox;
mod tmux;

#[cfg(test)]
mod fakes;

pub use audit::{AuditCategory, AuditEventType, AuditRecord, AUDIT_TARGET};
pub use backend::{DiscoveredSandbox, SandboxBackend, UnitHandle};
pub use cluster::{ClusterBackend, ClusterBackendConfig};
pub use config::{SandboxConfig, SandboxConfigBuilder, VolumeMount};
pub use credentials::{CredentialsInjector, CREDENTIALS_PATH};
pub use docker::{DockerBackend, DockerBackendConfig};
pub use error::{CoreError, ErrorKind, Result};
pub use events::{EventBus, ListenerError, SandboxEvent, Subscription};
pub use labels::{Labels, DEFAULT_LABEL_PREFIX};
pub use pool::{
    PoolConfig, PoolStats, ReconcileReport, WarmPool, WarmPoolEntry, WarmPoolMetrics, WarmState,
};
pub use provider::{CleanupFilter, ProviderConfig, SandboxProvider};
pub use sandbox::{
    ExecOptions, ExecResult, ExecStream, Sandbox, SandboxId, SandboxInfo, SandboxMetrics,
    SandboxStatus, KILLED_EXIT_CODE,
};
pub use tmux::{TmuxManager, TmuxSession};
