//! Daemon state shared by the HTTP handlers and the shutdown path.

use crate::config::{DaemonConfig, RuntimeKind};
use berth_core::{
    ClusterBackend, ClusterBackendConfig, DockerBackend, DockerBackendConfig, PoolConfig,
    ProviderConfig, SandboxBackend, SandboxProvider, WarmPool,
};
use berth_runtime::{KubePods, PodRuntime, PodTemplate};
use std::sync::Arc;

/// Provider plus the optional warm pool.
#[derive(Clone)]
pub struct Daemon {
    provider: Arc<SandboxProvider>,
    pool: Option<Arc<WarmPool>>,
}

impl Daemon {
    /// Wrap an existing provider and pool.
    pub fn new(provider: Arc<SandboxProvider>, pool: Option<Arc<WarmPool>>) -> Self {
        Self { provider, pool }
    }

    /// Connect to the configured runtime and build the provider.
    pub async fn connect(config: &DaemonConfig) -> anyhow::Result<Self> {
        let (backend, pool) = match config.runtime {
            RuntimeKind::Docker => (docker_backend(config), None),
            RuntimeKind::Cluster => cluster_backend(config).await?,
        };

        let provider = Arc::new(SandboxProvider::new(backend, ProviderConfig::default()));
        Ok(Self::new(provider, pool))
    }

    /// Adopt existing sandboxes and start the warm pool.
    pub async fn start(&self) -> anyhow::Result<()> {
        match self.provider.discover().await {
            Ok(adopted) => tracing::info!(adopted, "Existing sandboxes adopted"),
            Err(e) => tracing::warn!(error = %e, "Sandbox discovery failed"),
        }

        if let Some(pool) = &self.pool {
            let created = pool.start().await?;
            tracing::info!(created, target = pool.target_size(), "Warm pool started");
        }
        Ok(())
    }

    /// Stop the warm pool. Sandboxes keep running and are adopted again on
    /// the next start.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            let deleted = pool.stop().await;
            tracing::info!(deleted, "Warm pool stopped");
        }
    }

    pub fn provider(&self) -> &Arc<SandboxProvider> {
        &self.provider
    }

    pub fn pool(&self) -> Option<&Arc<WarmPool>> {
        self.pool.as_ref()
    }
}

fn docker_backend(config: &DaemonConfig) -> Arc<dyn SandboxBackend> {
    let backend = DockerBackend::connect(DockerBackendConfig {
        socket_path: config.docker_socket.clone(),
        label_prefix: config.label_prefix.clone(),
        ..Default::default()
    });
    Arc::new(backend)
}

async fn cluster_backend(
    config: &DaemonConfig,
) -> anyhow::Result<(Arc<dyn SandboxBackend>, Option<Arc<WarmPool>>)> {
    let pods: Arc<dyn PodRuntime> = Arc::new(KubePods::connect(&config.namespace).await?);
    let mut backend = ClusterBackend::new(
        Arc::clone(&pods),
        ClusterBackendConfig {
            namespace: config.namespace.clone(),
            label_prefix: config.label_prefix.clone(),
            ..Default::default()
        },
    );

    let pool = match (config.pool_enabled, &config.image) {
        (true, Some(image)) => {
            let pool = Arc::new(WarmPool::new(pods, pool_config(config, image)));
            backend = backend.with_pool(Arc::clone(&pool));
            Some(pool)
        }
        _ => None,
    };
    Ok((Arc::new(backend), pool))
}

fn pool_config(config: &DaemonConfig, image: &str) -> PoolConfig {
    let defaults = PoolConfig::default();
    PoolConfig {
        min_size: config.pool_min_size,
        max_size: config.pool_max_size,
        reconcile_interval: config.pool_reconcile_interval(),
        auto_scale: config.pool_autoscale,
        label_prefix: config.label_prefix.clone(),
        namespace: config.namespace.clone(),
        template: PodTemplate {
            image: image.to_string(),
            ..defaults.template.clone()
        },
        ..defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_from_daemon_config() {
        let config = DaemonConfig {
            runtime: RuntimeKind::Cluster,
            pool_enabled: true,
            pool_min_size: 3,
            pool_max_size: 7,
            pool_reconcile_secs: 15,
            namespace: "sandboxes".into(),
            ..Default::default()
        };
        let pool = pool_config(&config, "berth/agent:latest");

        assert_eq!(pool.min_size, 3);
        assert_eq!(pool.max_size, 7);
        assert_eq!(pool.reconcile_interval.as_secs(), 15);
        assert_eq!(pool.namespace, "sandboxes");
        assert_eq!(pool.template.image, "berth/agent:latest");
        assert_eq!(pool.template.command, vec!["sleep", "infinity"]);
        assert!(pool.validate().is_ok());
    }
}
