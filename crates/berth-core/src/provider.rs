//! Sandbox provider - owns sandboxes and the project mapping.
//!
//! The provider is the entry point for creating sandboxes. It keeps at most
//! one active sandbox per project and emits lifecycle events while creating.

use crate::backend::SandboxBackend;
use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::events::{EventBus, ListenerError, SandboxEvent, Subscription};
use crate::sandbox::{Sandbox, SandboxId, SandboxInfo, SandboxParts, SandboxStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, RwLock};

/// Configuration for [`SandboxProvider`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Project used by [`SandboxProvider::get`] when none is given.
    /// Default: `default`
    pub default_project_id: String,
    /// Idle timeout of sandboxes adopted by [`SandboxProvider::discover`].
    /// Default: 30 minutes
    pub discovered_idle_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_project_id: "default".to_string(),
            discovered_idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Selects sandboxes for [`SandboxProvider::cleanup`].
///
/// Every set criterion must match. The default filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct CleanupFilter {
    /// Match only these statuses.
    pub statuses: Option<Vec<SandboxStatus>>,
    /// Match sandboxes created longer ago than this.
    pub older_than: Option<Duration>,
    /// Match sandboxes past their idle timeout.
    pub idle_only: bool,
}

impl CleanupFilter {
    /// Match sandboxes in any of `statuses`.
    pub fn with_statuses(statuses: impl IntoIterator<Item = SandboxStatus>) -> Self {
        Self {
            statuses: Some(statuses.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Also require an age above `age`.
    pub fn older_than(mut self, age: Duration) -> Self {
        self.older_than = Some(age);
        self
    }

    /// Also require the sandbox to be idle.
    pub fn idle(mut self) -> Self {
        self.idle_only = true;
        self
    }

    fn matches(&self, sandbox: &Sandbox, now: DateTime<Utc>) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&sandbox.status()) {
                return false;
            }
        }
        if let Some(age) = self.older_than {
            let elapsed = now.signed_duration_since(sandbox.created_at());
            if elapsed.to_std().map(|e| e <= age).unwrap_or(true) {
                return false;
            }
        }
        !self.idle_only || sandbox.is_idle(now)
    }
}

/// Per-key async mutexes. Entries are dropped once nobody holds or waits on
/// them.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

pub(crate) struct KeyedGuard {
    key: String,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        // Only the map's reference left: nobody is waiting.
        if locks
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Creates, tracks and tears down sandboxes on one backend.
pub struct SandboxProvider {
    backend: Arc<dyn SandboxBackend>,
    config: ProviderConfig,
    sandboxes: RwLock<HashMap<SandboxId, Arc<Sandbox>>>,
    projects: RwLock<HashMap<String, SandboxId>>,
    create_locks: KeyedLocks,
    events: EventBus,
}

impl SandboxProvider {
    /// Create a provider over `backend`.
    pub fn new(backend: Arc<dyn SandboxBackend>, config: ProviderConfig) -> Self {
        tracing::info!(backend = backend.name(), "Creating sandbox provider");
        Self {
            backend,
            config,
            sandboxes: RwLock::new(HashMap::new()),
            projects: RwLock::new(HashMap::new()),
            create_locks: KeyedLocks::default(),
            events: EventBus::new(),
        }
    }

    /// Backend name.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Provider configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Register a lifecycle listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SandboxEvent) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Create a sandbox for `config.project_id`.
    ///
    /// Concurrent calls for one project run one at a time. Fails with
    /// [`CoreError::AlreadyExists`] while the project has an active sandbox,
    /// and with [`CoreError::CreationFailed`] when the backend fails.
    pub async fn create(&self, config: SandboxConfig) -> Result<Arc<Sandbox>> {
        config.validate()?;
        let project_id = config.project_id.clone();
        let _lock = self.create_locks.lock(&project_id).await;

        if let Some(existing) = self.get(Some(&project_id)).await {
            if existing.status().is_active() {
                return Err(CoreError::AlreadyExists {
                    project_id,
                    sandbox_id: existing.id(),
                });
            }
        }

        let id = SandboxId::new();
        let start = std::time::Instant::now();
        tracing::info!(
            sandbox_id = %id,
            project_id = %project_id,
            image = %config.image,
            "Creating sandbox"
        );
        self.events.emit(&SandboxEvent::Creating {
            sandbox_id: id,
            project_id: project_id.clone(),
        });

        match self.create_inner(id, &config).await {
            Ok(sandbox) => {
                self.sandboxes
                    .write()
                    .await
                    .insert(id, Arc::clone(&sandbox));
                self.projects.write().await.insert(project_id.clone(), id);
                self.events.emit(&SandboxEvent::Started {
                    sandbox_id: id,
                    project_id: project_id.clone(),
                });
                tracing::info!(
                    sandbox_id = %id,
                    project_id = %project_id,
                    handle = %sandbox.runtime_handle(),
                    pooled = sandbox.is_pooled(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox started"
                );
                Ok(sandbox)
            }
            Err(e) => {
                tracing::error!(
                    sandbox_id = %id,
                    project_id = %project_id,
                    error = %e,
                    "Sandbox creation failed"
                );
                self.events.emit(&SandboxEvent::Error {
                    sandbox_id: id,
                    project_id: project_id.clone(),
                    message: e.to_string(),
                });
                Err(CoreError::creation_failed(&project_id, e))
            }
        }
    }

    async fn create_inner(&self, id: SandboxId, config: &SandboxConfig) -> Result<Arc<Sandbox>> {
        let unit = self.backend.create_unit(id, config).await?;
        self.events.emit(&SandboxEvent::Created {
            sandbox_id: id,
            project_id: config.project_id.clone(),
            runtime_handle: unit.handle.clone(),
        });

        if let Err(e) = self.backend.start_unit(&unit, config).await {
            if let Err(cleanup) = self.backend.destroy_unit(&unit.handle).await {
                tracing::warn!(
                    sandbox_id = %id,
                    handle = %unit.handle,
                    error = %cleanup,
                    "Failed to remove unit after start failure"
                );
            }
            return Err(e);
        }

        Ok(Arc::new(Sandbox::new(
            SandboxParts {
                id,
                project_id: config.project_id.clone(),
                runtime_handle: unit.handle,
                status: SandboxStatus::Running,
                env: config.env.clone(),
                idle_timeout: config.idle_timeout(),
                pooled: unit.pooled,
                created_at: Utc::now(),
            },
            Arc::clone(&self.backend),
        )))
    }

    /// Sandbox mapped to `project_id`, or to the default project when `None`.
    pub async fn get(&self, project_id: Option<&str>) -> Option<Arc<Sandbox>> {
        let project_id = project_id.unwrap_or(&self.config.default_project_id);
        let id = *self.projects.read().await.get(project_id)?;
        self.get_by_id(id).await
    }

    /// Sandbox with the given id.
    pub async fn get_by_id(&self, id: SandboxId) -> Option<Arc<Sandbox>> {
        self.sandboxes.read().await.get(&id).cloned()
    }

    /// Snapshots of every tracked sandbox, oldest first.
    pub async fn list(&self) -> Vec<SandboxInfo> {
        let mut infos: Vec<SandboxInfo> = self
            .sandboxes
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Stop a sandbox. It stays tracked until removed or cleaned up.
    pub async fn stop(&self, id: SandboxId) -> Result<()> {
        let sandbox = self
            .get_by_id(id)
            .await
            .ok_or_else(|| CoreError::ContainerNotFound(id.to_string()))?;
        sandbox.stop().await
    }

    /// Stop a sandbox and stop tracking it.
    pub async fn remove(&self, id: SandboxId) -> Result<()> {
        self.stop(id).await?;
        self.evict(id).await;
        Ok(())
    }

    async fn evict(&self, id: SandboxId) {
        let Some(sandbox) = self.sandboxes.write().await.remove(&id) else {
            return;
        };
        let mut projects = self.projects.write().await;
        if projects.get(sandbox.project_id()) == Some(&id) {
            projects.remove(sandbox.project_id());
        }
        tracing::debug!(sandbox_id = %id, "Sandbox evicted");
    }

    /// Stop and evict every sandbox matching `filter`.
    ///
    /// Failures are logged and skipped. Returns the number removed.
    pub async fn cleanup(&self, filter: &CleanupFilter) -> usize {
        let now = Utc::now();
        let candidates: Vec<Arc<Sandbox>> = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|s| filter.matches(s, now))
            .cloned()
            .collect();

        let mut removed = 0;
        for sandbox in candidates {
            match sandbox.stop().await {
                Ok(()) => {
                    self.evict(sandbox.id()).await;
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %sandbox.id(),
                        error = %e,
                        "Cleanup failed to stop sandbox"
                    );
                }
            }
        }
        tracing::info!(removed, "Sandbox cleanup finished");
        removed
    }

    /// Rebuild tracking from the units on the runtime.
    ///
    /// Running units not yet tracked are adopted. Returns the number adopted.
    pub async fn discover(&self) -> Result<usize> {
        let found = self.backend.discover().await?;
        let mut sandboxes = self.sandboxes.write().await;
        let mut projects = self.projects.write().await;

        let mut adopted = 0;
        for unit in found {
            if !unit.running {
                tracing::debug!(handle = %unit.handle, "Skipping stopped unit");
                continue;
            }
            if sandboxes.contains_key(&unit.id) {
                continue;
            }
            if let Some(existing) = projects.get(&unit.project_id) {
                tracing::warn!(
                    project_id = %unit.project_id,
                    existing = %existing,
                    handle = %unit.handle,
                    "Project already has a sandbox, not adopting unit"
                );
                continue;
            }

            let sandbox = Sandbox::new(
                SandboxParts {
                    id: unit.id,
                    project_id: unit.project_id.clone(),
                    runtime_handle: unit.handle,
                    status: SandboxStatus::Running,
                    env: Default::default(),
                    idle_timeout: self.config.discovered_idle_timeout,
                    pooled: false,
                    created_at: unit.created_at,
                },
                Arc::clone(&self.backend),
            );
            projects.insert(unit.project_id, unit.id);
            sandboxes.insert(unit.id, Arc::new(sandbox));
            adopted += 1;
        }

        tracing::info!(adopted, "Sandbox discovery finished");
        Ok(adopted)
    }

    /// Stop every active sandbox. Returns the number stopped.
    pub async fn stop_all(&self) -> usize {
        let active: Vec<Arc<Sandbox>> = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|s| s.status().is_active())
            .cloned()
            .collect();

        let mut stopped = 0;
        for sandbox in active {
            match sandbox.stop().await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %sandbox.id(),
                        error = %e,
                        "Failed to stop sandbox"
                    );
                }
            }
        }
        stopped
    }
}
