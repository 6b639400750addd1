//! Warm pod pool for reducing cold-start latency.
//!
//! The pool keeps a reserve of pre-created sandbox pods so the cluster
//! backend can hand one out instead of waiting for a pod to be scheduled and
//! its image pulled.
//!
//! # Architecture
//!
//! Pool membership lives on the pods themselves, as labels:
//!
//! | Label | Value |
//! |---|---|
//! | `<ns>/warm-pool` | `true` |
//! | `<ns>/pool-id` | pool id |
//! | `<ns>/warm-pool-state` | `warm` or `allocated` |
//! | `<ns>/project-id` | owning project, once allocated |
//!
//! Local tracking is a cache over those labels. [`WarmPool::start`] rebuilds
//! it from a label query, and a background task reconciles it at a fixed
//! interval, replenishing the reserve and optionally resizing it.
//!
//! Allocation is a single label patch carrying the pod's
//! `resourceVersion` as a precondition. If another caller or process moved
//! the pod first the patch is rejected and the allocation is a miss.
//!
//! # Example
//!
//! ```ignore
//! use berth_core::{PoolConfig, WarmPool};
//!
//! let mut config = PoolConfig::default();
//! config.template.image = "berth/agent:latest".into();
//!
//! let pool = Arc::new(WarmPool::new(pods, config));
//! pool.start().await?;
//!
//! if let Some(pod) = pool.get_warm("proj-a").await {
//!     // hand `pod` to the sandbox
//! }
//!
//! pool.stop().await;
//! ```

use crate::audit::{AuditEventType, AuditRecord};
use crate::error::{CoreError, Result};
use crate::labels::{Labels, DEFAULT_LABEL_PREFIX};
use berth_runtime::{PodRuntime, PodSnapshot, PodTemplate, RuntimeError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the warm pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Identifies this pool's pods among others in the namespace.
    /// Default: `default`
    pub pool_id: String,

    /// Lower bound of the target size, and the initial target.
    /// Default: 2
    pub min_size: usize,

    /// Upper bound on tracked pods, warm and allocated together.
    /// Default: 10
    pub max_size: usize,

    /// Interval between reconciliation passes.
    /// Default: 30 seconds
    pub reconcile_interval: Duration,

    /// Resize the target between `min_size` and `max_size` by utilization.
    /// Default: false
    pub auto_scale: bool,

    /// Utilization percentage above which the target grows by one.
    /// Default: 80
    pub scale_up_threshold: f64,

    /// Utilization percentage below which the target shrinks by one.
    /// Default: 20
    pub scale_down_threshold: f64,

    /// Label namespace. Default: `berth.dev`
    pub label_prefix: String,

    /// Namespace recorded in audit records.
    pub namespace: String,

    /// Template for new warm pods. The name is generated per pod and pool
    /// labels are added on top of the template's labels.
    pub template: PodTemplate,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_id: "default".to_string(),
            min_size: 2,
            max_size: 10,
            reconcile_interval: Duration::from_secs(30),
            auto_scale: false,
            scale_up_threshold: 80.0,
            scale_down_threshold: 20.0,
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            namespace: "default".to_string(),
            template: PodTemplate {
                command: vec!["sleep".to_string(), "infinity".to_string()],
                ..Default::default()
            },
        }
    }
}

impl PoolConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool_id.is_empty() {
            return Err(CoreError::InvalidConfig("pool_id is required".into()));
        }
        if self.max_size == 0 || self.min_size > self.max_size {
            return Err(CoreError::InvalidConfig(format!(
                "pool size bounds invalid: min {} max {}",
                self.min_size, self.max_size
            )));
        }
        if self.template.image.is_empty() {
            return Err(CoreError::InvalidConfig(
                "pool template image is required".into(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(CoreError::InvalidConfig(
                "scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        if self.reconcile_interval.is_zero() {
            return Err(CoreError::InvalidConfig(
                "reconcile_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Pool state of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmState {
    /// Ready to be handed out.
    Warm,
    /// Handed out to a project.
    Allocated,
}

impl WarmState {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warm => "warm",
            Self::Allocated => "allocated",
        }
    }

    /// Parse a label value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warm" => Some(Self::Warm),
            "allocated" => Some(Self::Allocated),
            _ => None,
        }
    }
}

impl fmt::Display for WarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pod tracked by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmPoolEntry {
    /// Pod name.
    pub pod_name: String,
    /// Pool state.
    pub state: WarmState,
    /// Project the pod is allocated to. Set iff `state` is `Allocated`.
    pub allocated_project_id: Option<String>,
    /// When the pod was created.
    pub created_at: DateTime<Utc>,
    /// Last resource version seen for the pod.
    pub resource_version: Option<String>,
}

struct Tracked {
    entry: WarmPoolEntry,
    /// A `get_warm` call is patching this pod.
    claiming: bool,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Tracked>,
    /// Pods being created, counted against `max_size`.
    provisioning: usize,
}

impl PoolState {
    fn count(&self, state: WarmState) -> usize {
        self.entries
            .values()
            .filter(|t| t.entry.state == state)
            .count()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Pool counters.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Allocations served from the pool.
    pub hits: AtomicU64,
    /// Allocations the pool could not serve.
    pub misses: AtomicU64,
    /// Sum of successful allocation latencies, in milliseconds.
    pub allocation_ms_total: AtomicU64,
    /// Pods created by the pool.
    pub created: AtomicU64,
    /// Pods deleted by the pool.
    pub deleted: AtomicU64,
}

impl PoolStats {
    /// Get the number of hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get the number of misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            (hits / total) * 100.0
        }
    }

    /// Mean latency of successful allocations in milliseconds.
    pub fn avg_allocation_ms(&self) -> f64 {
        let hits = self.hits();
        if hits == 0 {
            0.0
        } else {
            self.allocation_ms_total.load(Ordering::Relaxed) as f64 / hits as f64
        }
    }
}

/// Point-in-time pool metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolMetrics {
    pub total_pods: usize,
    pub warm_pods: usize,
    pub allocated_pods: usize,
    pub utilization_percent: f64,
    pub hit_rate_percent: f64,
    pub avg_warm_allocation_ms: f64,
    pub target_size: usize,
    pub warm_pool_hits: u64,
    pub warm_pool_misses: u64,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Labeled pods that were not tracked yet.
    pub adopted: usize,
    /// Tracked pods that no longer exist.
    pub dropped: usize,
    /// Terminated or unpullable pods deleted.
    pub deleted: usize,
    /// Warm pods created to reach the target.
    pub created: usize,
    /// Target size after the pass.
    pub target_size: usize,
}

enum ClaimMiss {
    Vanished,
    Taken(Option<String>),
    Rejected(RuntimeError),
}

// ============================================================================
// Pool Implementation
// ============================================================================

/// Label-reconciled pool of warm sandbox pods.
///
/// Shared as `Arc<WarmPool>`; the background reconciler only holds a weak
/// reference.
pub struct WarmPool {
    pods: Arc<dyn PodRuntime>,
    config: PoolConfig,
    labels: Labels,
    state: Mutex<PoolState>,
    target_size: AtomicUsize,
    stats: PoolStats,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    reconciler: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WarmPool {
    /// Create a pool. Nothing is queried or created until
    /// [`start()`](Self::start).
    pub fn new(pods: Arc<dyn PodRuntime>, config: PoolConfig) -> Self {
        tracing::info!(
            pool_id = %config.pool_id,
            min_size = config.min_size,
            max_size = config.max_size,
            "Creating warm pool"
        );

        Self {
            labels: Labels::new(config.label_prefix.clone()),
            target_size: AtomicUsize::new(config.min_size),
            pods,
            config,
            state: Mutex::new(PoolState::default()),
            stats: PoolStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            reconciler: std::sync::Mutex::new(None),
        }
    }

    /// Discover existing pool pods, replenish to the target and start the
    /// background reconciler. Returns the number of pods created.
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        self.config.validate()?;
        if self.is_running() {
            tracing::warn!(pool_id = %self.config.pool_id, "Warm pool already started");
            return Ok(0);
        }
        self.shutdown.store(false, Ordering::Relaxed);

        let report = self.reconcile_once(false).await?;
        tracing::info!(
            pool_id = %self.config.pool_id,
            adopted = report.adopted,
            created = report.created,
            target = report.target_size,
            "Warm pool started"
        );

        let handle = tokio::spawn(Self::reconcile_loop(
            Arc::downgrade(self),
            self.config.reconcile_interval,
            Arc::clone(&self.shutdown),
            Arc::clone(&self.shutdown_notify),
        ));
        *self.reconciler_slot() = Some(handle);

        Ok(report.created)
    }

    fn reconciler_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reconciler.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Background reconciliation loop.
    ///
    /// Runs until shutdown is signaled or the pool is dropped.
    async fn reconcile_loop(
        pool: Weak<WarmPool>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) {
        tracing::debug!("Reconcile loop started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_notify.notified() => {
                    tracing::info!("Warm pool reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    match pool.reconcile().await {
                        Ok(report) => tracing::debug!(
                            adopted = report.adopted,
                            dropped = report.dropped,
                            deleted = report.deleted,
                            created = report.created,
                            target = report.target_size,
                            "Warm pool reconciled"
                        ),
                        Err(e) => tracing::warn!(error = %e, "Warm pool reconciliation failed"),
                    }
                }
            }
        }

        tracing::debug!("Reconcile loop exited");
    }

    /// Run one reconciliation pass now.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconcile_once(self.config.auto_scale).await
    }

    async fn reconcile_once(&self, auto_scale: bool) -> Result<ReconcileReport> {
        let selector = self.labels.pool_selector(&self.config.pool_id);
        let pods = self.pods.list_pods(&selector).await?;

        let (mut report, stale) = self.sync(pods).await;
        for name in stale {
            if self.delete_pod(&name, "terminated").await.is_ok() {
                report.deleted += 1;
            }
        }

        if auto_scale {
            self.autoscale().await;
        }
        report.created = self.replenish().await;
        report.target_size = self.target_size();
        Ok(report)
    }

    /// Bring local tracking in line with the labeled pods. Returns pods that
    /// should be deleted.
    async fn sync(&self, pods: Vec<PodSnapshot>) -> (ReconcileReport, Vec<String>) {
        let mut report = ReconcileReport::default();
        let mut stale = Vec::new();
        let live: HashMap<String, PodSnapshot> =
            pods.into_iter().map(|p| (p.name.clone(), p)).collect();

        let mut state = self.state.lock().await;
        state.entries.retain(|name, tracked| {
            let keep = tracked.claiming || live.contains_key(name);
            if !keep {
                tracing::debug!(pod = %name, "Warm pool pod vanished");
                report.dropped += 1;
            }
            keep
        });

        for (name, pod) in live {
            if pod.is_terminated() || pod.is_image_pull_failure() {
                tracing::warn!(
                    pod = %name,
                    phase = ?pod.phase,
                    reason = ?pod.waiting_reason,
                    "Removing unusable warm pool pod"
                );
                state.entries.remove(&name);
                if !pod.deleting {
                    stale.push(name);
                }
                continue;
            }

            let pool_state = pod
                .label(&self.labels.warm_pool_state())
                .and_then(WarmState::parse)
                .unwrap_or(WarmState::Warm);
            let project = match pool_state {
                WarmState::Allocated => pod.label(&self.labels.project_id()).map(str::to_string),
                WarmState::Warm => None,
            };

            match state.entries.get_mut(&name) {
                Some(tracked) if tracked.claiming => {}
                Some(tracked) => {
                    tracked.entry.state = pool_state;
                    tracked.entry.allocated_project_id = project;
                    tracked.entry.resource_version = pod.resource_version;
                }
                None => {
                    report.adopted += 1;
                    state.entries.insert(
                        name.clone(),
                        Tracked {
                            entry: WarmPoolEntry {
                                pod_name: name,
                                state: pool_state,
                                allocated_project_id: project,
                                created_at: pod.created_at.unwrap_or_else(Utc::now),
                                resource_version: pod.resource_version,
                            },
                            claiming: false,
                        },
                    );
                }
            }
        }

        (report, stale)
    }

    /// Create warm pods until the warm count reaches the target.
    async fn replenish(&self) -> usize {
        let warm = self.state.lock().await.count(WarmState::Warm);
        let target = self.target_size();
        if warm >= target {
            return 0;
        }
        tracing::debug!(warm, target, "Warm pool below target, filling");
        self.prewarm(target - warm).await
    }

    /// Create up to `n` warm pods, never exceeding `max_size` tracked pods.
    ///
    /// Failed creations are logged and skipped. Returns the number created.
    pub async fn prewarm(&self, n: usize) -> usize {
        let count = {
            let mut state = self.state.lock().await;
            let current = state.entries.len() + state.provisioning;
            let count = n.min(self.config.max_size.saturating_sub(current));
            state.provisioning += count;
            count
        };
        if count < n {
            tracing::debug!(
                requested = n,
                allowed = count,
                "Prewarm clamped to max_size"
            );
        }
        if count == 0 {
            return 0;
        }

        let pending = (0..count).map(|_| self.create_warm_pod());
        let results = futures::future::join_all(pending).await;

        let mut state = self.state.lock().await;
        state.provisioning -= count;
        let mut created = 0;
        for entry in results.into_iter().flatten() {
            state.entries.insert(
                entry.pod_name.clone(),
                Tracked {
                    entry,
                    claiming: false,
                },
            );
            created += 1;
        }
        tracing::info!(created, requested = n, "Warm pods created");
        created
    }

    async fn create_warm_pod(&self) -> Option<WarmPoolEntry> {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("berth-warm-{}", &simple[..12]);

        let mut template = self.config.template.clone();
        template.name = name.clone();
        template.labels.extend([
            (self.labels.sandbox(), "true".to_string()),
            (self.labels.warm_pool(), "true".to_string()),
            (self.labels.warm_pool_state(), WarmState::Warm.to_string()),
            (self.labels.pool_id(), self.config.pool_id.clone()),
        ]);

        match self.pods.create_pod(&template).await {
            Ok(pod) => {
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                AuditRecord::new(AuditEventType::WarmPoolPodCreated, &name)
                    .namespace(&self.config.namespace)
                    .detail("poolId", self.config.pool_id.as_str())
                    .emit();
                tracing::debug!(pod = %name, "Warm pod created");
                Some(WarmPoolEntry {
                    pod_name: name,
                    state: WarmState::Warm,
                    allocated_project_id: None,
                    created_at: pod.created_at.unwrap_or_else(Utc::now),
                    resource_version: pod.resource_version,
                })
            }
            Err(e) => {
                tracing::warn!(pod = %name, error = %e, "Failed to create warm pod");
                AuditRecord::new(AuditEventType::WarmPoolPodCreated, &name)
                    .namespace(&self.config.namespace)
                    .failed(&e)
                    .emit();
                None
            }
        }
    }

    /// Hand a warm pod to `project_id`.
    ///
    /// Returns the pod name, or `None` on a miss. A miss leaves the pool
    /// unchanged apart from the counters.
    pub async fn get_warm(&self, project_id: &str) -> Option<String> {
        let start = Instant::now();

        let candidate = {
            let mut state = self.state.lock().await;
            state
                .entries
                .values_mut()
                .filter(|t| t.entry.state == WarmState::Warm && !t.claiming)
                .min_by_key(|t| t.entry.created_at)
                .map(|t| {
                    t.claiming = true;
                    (t.entry.pod_name.clone(), t.entry.resource_version.clone())
                })
        };

        let Some((pod_name, tracked_version)) = candidate else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(project_id, "No warm pod available");
            return None;
        };

        let outcome = self.claim(&pod_name, tracked_version, project_id).await;

        let mut state = self.state.lock().await;
        let tracked = state.entries.get_mut(&pod_name);
        match outcome {
            Ok(pod) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                if let Some(tracked) = tracked {
                    tracked.claiming = false;
                    tracked.entry.state = WarmState::Allocated;
                    tracked.entry.allocated_project_id = Some(project_id.to_string());
                    tracked.entry.resource_version = pod.resource_version;
                }
                drop(state);

                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .allocation_ms_total
                    .fetch_add(elapsed_ms, Ordering::Relaxed);
                AuditRecord::new(AuditEventType::WarmPoolPodAllocated, &pod_name)
                    .namespace(&self.config.namespace)
                    .project(project_id)
                    .detail("allocationMs", elapsed_ms)
                    .emit();
                tracing::info!(pod = %pod_name, project_id, elapsed_ms, "Warm pod allocated");
                Some(pod_name)
            }
            Err(miss) => {
                if let Some(tracked) = tracked {
                    tracked.claiming = false;
                    if let ClaimMiss::Taken(project) = &miss {
                        tracked.entry.state = WarmState::Allocated;
                        tracked.entry.allocated_project_id = project.clone();
                    }
                }
                drop(state);

                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                match miss {
                    ClaimMiss::Vanished => {
                        tracing::debug!(pod = %pod_name, project_id, "Warm pod vanished")
                    }
                    ClaimMiss::Taken(_) => {
                        tracing::debug!(pod = %pod_name, project_id, "Warm pod already allocated")
                    }
                    ClaimMiss::Rejected(e) if e.is_conflict() => {
                        tracing::debug!(pod = %pod_name, project_id, "Warm pod claim conflicted")
                    }
                    ClaimMiss::Rejected(e) => {
                        tracing::warn!(
                            pod = %pod_name,
                            project_id,
                            error = %e,
                            "Warm pod claim failed"
                        )
                    }
                }
                None
            }
        }
    }

    /// Patch a pod to `allocated`, conditional on its current version.
    async fn claim(
        &self,
        pod_name: &str,
        tracked_version: Option<String>,
        project_id: &str,
    ) -> std::result::Result<PodSnapshot, ClaimMiss> {
        let current = match self.pods.get_pod(pod_name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => return Err(ClaimMiss::Vanished),
            Err(e) => return Err(ClaimMiss::Rejected(e)),
        };
        if current.is_terminated() {
            return Err(ClaimMiss::Vanished);
        }

        let state_key = self.labels.warm_pool_state();
        if current.label(&state_key) != Some(WarmState::Warm.as_str()) {
            let project = current.label(&self.labels.project_id()).map(str::to_string);
            return Err(ClaimMiss::Taken(project));
        }

        let version = current.resource_version.or(tracked_version);
        let labels = BTreeMap::from([
            (state_key, WarmState::Allocated.to_string()),
            (self.labels.project_id(), project_id.to_string()),
        ]);
        self.pods
            .patch_labels(pod_name, version.as_deref(), &labels)
            .await
            .map_err(ClaimMiss::Rejected)
    }

    /// Delete a pod and stop tracking it. Unknown names are a no-op.
    pub async fn release(&self, pod_name: &str) -> Result<()> {
        let removed = self.state.lock().await.entries.remove(pod_name);
        let Some(tracked) = removed else {
            tracing::debug!(pod = pod_name, "Release of untracked pod ignored");
            return Ok(());
        };

        tracing::info!(
            pod = pod_name,
            project_id = ?tracked.entry.allocated_project_id,
            "Releasing warm pool pod"
        );
        self.delete_pod(pod_name, "released").await
    }

    async fn delete_pod(&self, pod_name: &str, reason: &str) -> Result<()> {
        match self.pods.delete_pod(pod_name).await {
            Ok(()) => {
                self.stats.deleted.fetch_add(1, Ordering::Relaxed);
                AuditRecord::new(AuditEventType::WarmPoolPodReleased, pod_name)
                    .namespace(&self.config.namespace)
                    .detail("reason", reason)
                    .emit();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(pod = pod_name, "Pod already deleted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(pod = pod_name, error = %e, "Failed to delete pool pod");
                AuditRecord::new(AuditEventType::WarmPoolPodReleased, pod_name)
                    .namespace(&self.config.namespace)
                    .detail("reason", reason)
                    .failed(&e)
                    .emit();
                Err(e.into())
            }
        }
    }

    /// True if `pod_name` is tracked by the pool.
    pub async fn tracks(&self, pod_name: &str) -> bool {
        self.state.lock().await.entries.contains_key(pod_name)
    }

    /// Adjust the target size by one step based on utilization.
    ///
    /// Returns the new target.
    pub async fn autoscale(&self) -> usize {
        let (total, allocated) = {
            let state = self.state.lock().await;
            (state.entries.len(), state.count(WarmState::Allocated))
        };
        let utilization = percent(allocated, total);

        let current = self.target_size();
        let next = if utilization > self.config.scale_up_threshold {
            (current + 1).min(self.config.max_size)
        } else if utilization < self.config.scale_down_threshold {
            current.saturating_sub(1).max(self.config.min_size)
        } else {
            current
        };

        if next != current {
            self.target_size.store(next, Ordering::Relaxed);
            tracing::info!(
                from = current,
                to = next,
                utilization,
                "Warm pool target resized"
            );
            AuditRecord::new(AuditEventType::WarmPoolScaled, &self.config.pool_id)
                .namespace(&self.config.namespace)
                .detail("from", current)
                .detail("to", next)
                .detail("utilizationPercent", utilization)
                .emit();
        }
        next
    }

    /// Current target size.
    pub fn target_size(&self) -> usize {
        self.target_size.load(Ordering::Relaxed)
    }

    /// Snapshot of the tracked pods, sorted by name.
    pub async fn entries(&self) -> Vec<WarmPoolEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<WarmPoolEntry> =
            state.entries.values().map(|t| t.entry.clone()).collect();
        entries.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
        entries
    }

    /// Point-in-time metrics.
    pub async fn metrics(&self) -> WarmPoolMetrics {
        let (total, warm, allocated) = {
            let state = self.state.lock().await;
            (
                state.entries.len(),
                state.count(WarmState::Warm),
                state.count(WarmState::Allocated),
            )
        };

        WarmPoolMetrics {
            total_pods: total,
            warm_pods: warm,
            allocated_pods: allocated,
            utilization_percent: percent(allocated, total),
            hit_rate_percent: self.stats.hit_rate(),
            avg_warm_allocation_ms: self.stats.avg_allocation_ms(),
            target_size: self.target_size(),
            warm_pool_hits: self.stats.hits(),
            warm_pool_misses: self.stats.misses(),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the pool counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Check if the reconciler is running.
    pub fn is_running(&self) -> bool {
        self.reconciler_slot().is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn reconciler_finished(&self) -> bool {
        self.reconciler_slot()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Stop the reconciler and delete every warm pod.
    ///
    /// Allocated pods are left to their owners. Returns the number of pods
    /// deleted.
    pub async fn stop(&self) -> usize {
        tracing::info!(pool_id = %self.config.pool_id, "Stopping warm pool");

        self.shutdown.store(true, Ordering::Relaxed);

        // A permit stored without a waiting loop would end the next one.
        let handle = self.reconciler_slot().take();
        if let Some(handle) = handle {
            self.shutdown_notify.notify_one();
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Reconciler task panicked during shutdown");
            }
        }

        let warm: Vec<String> = {
            let mut state = self.state.lock().await;
            let names: Vec<String> = state
                .entries
                .values()
                .filter(|t| t.entry.state == WarmState::Warm && !t.claiming)
                .map(|t| t.entry.pod_name.clone())
                .collect();
            for name in &names {
                state.entries.remove(name);
            }
            names
        };

        let mut deleted = 0;
        for name in &warm {
            if self.delete_pod(name, "pool stopped").await.is_ok() {
                deleted += 1;
            }
        }

        tracing::info!(
            deleted,
            hits = self.stats.hits(),
            misses = self.stats.misses(),
            hit_rate = format!("{:.1}%", self.stats.hit_rate()),
            "Warm pool stopped"
        );
        deleted
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakePodRuntime;
    use std::collections::HashSet;

    fn config(min_size: usize, max_size: usize) -> PoolConfig {
        let mut config = PoolConfig {
            min_size,
            max_size,
            reconcile_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        config.template.image = "berth/agent:latest".into();
        config
    }

    fn pool(pods: &Arc<FakePodRuntime>, min_size: usize, max_size: usize) -> Arc<WarmPool> {
        let runtime: Arc<dyn PodRuntime> = pods.clone();
        Arc::new(WarmPool::new(runtime, config(min_size, max_size)))
    }

    fn pool_labels(state: &str) -> Vec<(String, String)> {
        let labels = Labels::default();
        vec![
            (labels.warm_pool(), "true".into()),
            (labels.pool_id(), "default".into()),
            (labels.warm_pool_state(), state.into()),
        ]
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 2);
        assert_eq!(config.max_size, 10);
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert!(!config.auto_scale);
        assert!(config.validate().is_err(), "template image is required");
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(config(2, 5).validate().is_ok());
        assert!(config(6, 5).validate().is_err());
        assert!(config(0, 0).validate().is_err());
    }

    #[test]
    fn test_pool_stats_hit_rate() {
        let stats = PoolStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.avg_allocation_ms(), 0.0);

        stats.hits.store(3, Ordering::Relaxed);
        stats.misses.store(1, Ordering::Relaxed);
        stats.allocation_ms_total.store(30, Ordering::Relaxed);
        assert!((stats.hit_rate() - 75.0).abs() < 0.01);
        assert!((stats.avg_allocation_ms() - 10.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_start_on_empty_cluster_creates_min_size() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 2, 5);

        let created = pool.start().await.unwrap();
        assert_eq!(created, 2);
        assert_eq!(pods.created().len(), 2);
        assert!(pool.is_running());

        let created_pod = pods.pod(&pods.created()[0]).unwrap();
        assert_eq!(created_pod.label("berth.dev/warm-pool-state"), Some("warm"));
        assert_eq!(created_pod.label("berth.dev/sandbox"), Some("true"));

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_start_adopts_existing_pods() {
        let pods = Arc::new(FakePodRuntime::new());
        pods.insert_pod("warm-1", &pool_labels("warm"), "Running");
        let mut allocated = pool_labels("allocated");
        allocated.push(("berth.dev/project-id".into(), "proj-x".into()));
        pods.insert_pod("alloc-1", &allocated, "Running");
        pods.insert_pod("other", &[], "Running");

        let pool = pool(&pods, 2, 5);
        let created = pool.start().await.unwrap();

        // One warm pod was found, so one more is needed.
        assert_eq!(created, 1);
        let entries = pool.entries().await;
        assert_eq!(entries.len(), 3);
        let alloc = entries.iter().find(|e| e.pod_name == "alloc-1").unwrap();
        assert_eq!(alloc.state, WarmState::Allocated);
        assert_eq!(alloc.allocated_project_id.as_deref(), Some("proj-x"));
        assert!(!pool.tracks("other").await);
    }

    #[tokio::test]
    async fn test_prewarm_bounded_by_max_size() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 3, 5);
        pool.start().await.unwrap();

        assert_eq!(pool.prewarm(10).await, 2);
        assert_eq!(pool.prewarm(10).await, 0);
        assert_eq!(pods.created().len(), 5);
    }

    #[tokio::test]
    async fn test_prewarm_skips_failures() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 0, 5);
        pods.fail_next_creates(1);

        assert_eq!(pool.prewarm(3).await, 2);
        assert_eq!(pool.entries().await.len(), 2);
        // The failed slot is free again.
        assert_eq!(pool.prewarm(10).await, 3);
    }

    #[tokio::test]
    async fn test_get_warm_allocates_one_pod() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 2, 5);
        pool.start().await.unwrap();

        let pod = pool.get_warm("proj-A").await.expect("warm pod");
        let live = pods.pod(&pod).unwrap();
        assert_eq!(live.label("berth.dev/warm-pool-state"), Some("allocated"));
        assert_eq!(live.label("berth.dev/project-id"), Some("proj-A"));

        let metrics = pool.metrics().await;
        assert_eq!(metrics.warm_pods, 1);
        assert_eq!(metrics.allocated_pods, 1);
        assert_eq!(metrics.warm_pool_hits, 1);
        assert_eq!(metrics.hit_rate_percent, 100.0);
        assert_eq!(metrics.utilization_percent, 50.0);
    }

    #[tokio::test]
    async fn test_concurrent_get_warm_distinct() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 4, 8);
        pool.start().await.unwrap();

        let claims = (0..4).map(|i| {
            let pool = Arc::clone(&pool);
            async move { pool.get_warm(&format!("proj-{i}")).await }
        });
        let claims = futures::future::join_all(claims).await;

        let names: HashSet<String> = claims.into_iter().map(|c| c.expect("hit")).collect();
        assert_eq!(names.len(), 4);
        assert_eq!(pool.stats().misses(), 0);

        assert!(pool.get_warm("proj-late").await.is_none());
        assert_eq!(pool.stats().misses(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_claim_is_miss() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 1, 5);
        pool.start().await.unwrap();

        pods.conflict_next_patch();
        assert!(pool.get_warm("proj-a").await.is_none());

        let entries = pool.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, WarmState::Warm);
        assert_eq!(pool.stats().misses(), 1);

        // Still claimable afterwards.
        assert!(pool.get_warm("proj-a").await.is_some());
    }

    #[tokio::test]
    async fn test_claim_of_pod_taken_elsewhere_is_miss() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 1, 5);
        pool.start().await.unwrap();
        let name = pods.created()[0].clone();

        // Another replica allocates the pod behind our back.
        let labels = BTreeMap::from([
            ("berth.dev/warm-pool-state".to_string(), "allocated".to_string()),
            ("berth.dev/project-id".to_string(), "proj-other".to_string()),
        ]);
        pods.patch_labels(&name, None, &labels).await.unwrap();

        assert!(pool.get_warm("proj-a").await.is_none());
        let entries = pool.entries().await;
        assert_eq!(entries[0].state, WarmState::Allocated);
        let owner = entries[0].allocated_project_id.as_deref();
        assert_eq!(owner, Some("proj-other"));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 1, 5);
        pool.start().await.unwrap();
        let pod = pool.get_warm("proj-a").await.unwrap();

        pool.release(&pod).await.unwrap();
        pool.release(&pod).await.unwrap();
        pool.release("never-created").await.unwrap();

        assert!(pods.pod(&pod).is_none());
        assert_eq!(pods.deleted(), vec![pod]);
    }

    #[tokio::test]
    async fn test_release_of_already_deleted_pod() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 1, 5);
        pool.start().await.unwrap();
        let pod = pods.created()[0].clone();

        pods.vanish(&pod);
        pool.release(&pod).await.unwrap();
        assert!(!pool.tracks(&pod).await);
    }

    #[tokio::test]
    async fn test_stop_deletes_only_warm_pods() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 3, 5);
        pool.start().await.unwrap();
        let allocated = pool.get_warm("proj-a").await.unwrap();

        assert_eq!(pool.stop().await, 2);
        assert!(!pool.is_running());
        assert_eq!(pods.pod_names(), vec![allocated.clone()]);
        assert!(pool.tracks(&allocated).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_keeps_next_reconciler() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 1, 5);

        assert_eq!(pool.stop().await, 0);
        pool.start().await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(pool.is_running());
        assert!(!pool.reconciler_finished());

        pool.stop().await;
        assert!(pool.reconciler_finished());
    }

    #[tokio::test]
    async fn test_reconcile_repairs_tracking() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 2, 5);
        pool.start().await.unwrap();
        let created = pods.created();

        pods.vanish(&created[0]);
        pods.set_phase(&created[1], "Failed");
        pods.insert_pod("adopted", &pool_labels("warm"), "Running");

        let report = pool.reconcile().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.adopted, 1);
        // "adopted" is warm, one more reaches the target of 2.
        assert_eq!(report.created, 1);
        assert!(pods.deleted().contains(&created[1]));
        assert_eq!(pool.metrics().await.warm_pods, 2);
    }

    #[tokio::test]
    async fn test_autoscale_clamped() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 2, 3);
        pool.start().await.unwrap();

        // 0% utilization, already at min.
        assert_eq!(pool.autoscale().await, 2);

        pool.get_warm("a").await.unwrap();
        pool.get_warm("b").await.unwrap();
        // 100% utilization.
        assert_eq!(pool.autoscale().await, 3);
        assert_eq!(pool.autoscale().await, 3);
    }

    #[tokio::test]
    async fn test_metrics_json_shape() {
        let pods = Arc::new(FakePodRuntime::new());
        let pool = pool(&pods, 1, 5);
        pool.start().await.unwrap();

        let json = serde_json::to_value(pool.metrics().await).unwrap();
        for key in [
            "totalPods",
            "warmPods",
            "allocatedPods",
            "utilizationPercent",
            "hitRatePercent",
            "avgWarmAllocationMs",
            "targetSize",
            "warmPoolHits",
            "warmPoolMisses",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["targetSize"], 1);
    }
}
