//! Configuration for the daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Which runtime sandboxes run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeKind {
    /// Containers on the local Docker engine.
    #[default]
    Docker,
    /// Pods in a Kubernetes namespace.
    Cluster,
}

impl RuntimeKind {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "cluster" | "kubernetes" | "k8s" => Some(Self::Cluster),
            _ => None,
        }
    }
}

/// Configuration for the Berth daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Runtime backend (default: docker).
    pub runtime: RuntimeKind,

    /// Docker engine socket.
    pub docker_socket: PathBuf,

    /// Namespace for sandbox and warm pods.
    pub namespace: String,

    /// Label namespace on every unit.
    pub label_prefix: String,

    /// Image for warm pool pods.
    pub image: Option<String>,

    /// Run a warm pool (cluster only, default: false).
    pub pool_enabled: bool,

    /// Warm pool lower bound (default: 2).
    pub pool_min_size: usize,

    /// Warm pool upper bound (default: 10).
    pub pool_max_size: usize,

    /// Seconds between reconciliation passes (default: 30).
    pub pool_reconcile_secs: u64,

    /// Resize the pool by utilization (default: false).
    pub pool_autoscale: bool,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown runtime: {0} (expected docker or cluster)")]
    UnknownRuntime(String),

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("warm pool requires the cluster runtime")]
    PoolWithoutCluster,

    #[error("warm pool requires BERTH_IMAGE")]
    MissingImage,

    #[error("pool min size {min} exceeds max size {max}")]
    InvalidPoolSize { min: usize, max: usize },

    #[error("pool reconcile interval must be > 0")]
    ZeroReconcileInterval,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Docker,
            docker_socket: PathBuf::from(berth_runtime::DEFAULT_DOCKER_SOCKET),
            namespace: "default".to_string(),
            label_prefix: berth_core::DEFAULT_LABEL_PREFIX.to_string(),
            image: None,
            pool_enabled: false,
            pool_min_size: 2,
            pool_max_size: 10,
            pool_reconcile_secs: 30,
            pool_autoscale: false,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
        }
    }
}

fn flag(value: &str) -> bool {
    value != "false" && value != "0"
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BERTH_RUNTIME` | `docker` (docker, cluster) |
    /// | `BERTH_DOCKER_SOCKET` | `/var/run/docker.sock` |
    /// | `BERTH_NAMESPACE` | `default` |
    /// | `BERTH_LABEL_PREFIX` | `berth.dev` |
    /// | `BERTH_IMAGE` | unset |
    /// | `BERTH_POOL_ENABLED` | `false` |
    /// | `BERTH_POOL_MIN_SIZE` | `2` |
    /// | `BERTH_POOL_MAX_SIZE` | `10` |
    /// | `BERTH_POOL_RECONCILE_SECS` | `30` |
    /// | `BERTH_POOL_AUTOSCALE` | `false` |
    /// | `BERTH_HTTP_HOST` | `0.0.0.0` |
    /// | `BERTH_HTTP_PORT` | `8080` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(var) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { var, value }),
                None => Ok(default),
            }
        }

        let default = Self::default();
        let lookup = &lookup as &dyn Fn(&str) -> Option<String>;

        let runtime = match lookup("BERTH_RUNTIME") {
            Some(value) => RuntimeKind::parse(&value).ok_or(ConfigError::UnknownRuntime(value))?,
            None => default.runtime,
        };
        let http_host: IpAddr = parsed(lookup, "BERTH_HTTP_HOST", default.http_addr.ip())?;
        let http_port: u16 = parsed(lookup, "BERTH_HTTP_PORT", default.http_addr.port())?;

        Ok(Self {
            runtime,
            docker_socket: lookup("BERTH_DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(default.docker_socket),
            namespace: lookup("BERTH_NAMESPACE").unwrap_or(default.namespace),
            label_prefix: lookup("BERTH_LABEL_PREFIX").unwrap_or(default.label_prefix),
            image: lookup("BERTH_IMAGE").filter(|v| !v.trim().is_empty()),
            pool_enabled: lookup("BERTH_POOL_ENABLED")
                .map(|v| flag(&v))
                .unwrap_or(default.pool_enabled),
            pool_min_size: parsed(lookup, "BERTH_POOL_MIN_SIZE", default.pool_min_size)?,
            pool_max_size: parsed(lookup, "BERTH_POOL_MAX_SIZE", default.pool_max_size)?,
            pool_reconcile_secs: parsed(
                lookup,
                "BERTH_POOL_RECONCILE_SECS",
                default.pool_reconcile_secs,
            )?,
            pool_autoscale: lookup("BERTH_POOL_AUTOSCALE")
                .map(|v| flag(&v))
                .unwrap_or(default.pool_autoscale),
            http_addr: SocketAddr::new(http_host, http_port),
        })
    }

    /// Check settings that depend on each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.pool_enabled {
            return Ok(());
        }
        if self.runtime != RuntimeKind::Cluster {
            return Err(ConfigError::PoolWithoutCluster);
        }
        if self.image.is_none() {
            return Err(ConfigError::MissingImage);
        }
        if self.pool_min_size > self.pool_max_size {
            return Err(ConfigError::InvalidPoolSize {
                min: self.pool_min_size,
                max: self.pool_max_size,
            });
        }
        if self.pool_reconcile_secs == 0 {
            return Err(ConfigError::ZeroReconcileInterval);
        }
        Ok(())
    }

    /// Log warnings for settings that only fail later at runtime.
    pub fn validate_warn(&self) {
        if self.runtime == RuntimeKind::Docker && !self.docker_socket.exists() {
            tracing::warn!("Docker socket not found: {:?}", self.docker_socket);
        }
    }

    /// Reconcile interval as a duration.
    pub fn pool_reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.pool_reconcile_secs)
    }
}
