//! Audit records for cluster-side changes.
//!
//! Records are serialized as one JSON object per line and emitted on the
//! `berth::audit` tracing target. Shipping them anywhere is up to the
//! subscriber.

use crate::sandbox::SandboxId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Tracing target audit lines are written to.
pub const AUDIT_TARGET: &str = "berth::audit";

/// Category of an audited change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Sandbox pods.
    Pod,
    /// Network policies guarding sandboxes.
    NetworkPolicy,
    /// Roles and bindings.
    Rbac,
    /// Warm pool membership.
    WarmPool,
}

/// Stable audit vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AuditEventType {
    #[serde(rename = "pod.created")]
    PodCreated,
    #[serde(rename = "pod.deleted")]
    PodDeleted,
    #[serde(rename = "pod.create_failed")]
    PodCreateFailed,
    #[serde(rename = "network_policy.created")]
    NetworkPolicyCreated,
    #[serde(rename = "network_policy.deleted")]
    NetworkPolicyDeleted,
    #[serde(rename = "rbac.role_created")]
    RbacRoleCreated,
    #[serde(rename = "rbac.role_deleted")]
    RbacRoleDeleted,
    #[serde(rename = "warm_pool.pod_created")]
    WarmPoolPodCreated,
    #[serde(rename = "warm_pool.pod_allocated")]
    WarmPoolPodAllocated,
    #[serde(rename = "warm_pool.pod_released")]
    WarmPoolPodReleased,
    #[serde(rename = "warm_pool.scaled")]
    WarmPoolScaled,
}

impl AuditEventType {
    /// Wire name, e.g. `warm_pool.pod_allocated`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PodCreated => "pod.created",
            Self::PodDeleted => "pod.deleted",
            Self::PodCreateFailed => "pod.create_failed",
            Self::NetworkPolicyCreated => "network_policy.created",
            Self::NetworkPolicyDeleted => "network_policy.deleted",
            Self::RbacRoleCreated => "rbac.role_created",
            Self::RbacRoleDeleted => "rbac.role_deleted",
            Self::WarmPoolPodCreated => "warm_pool.pod_created",
            Self::WarmPoolPodAllocated => "warm_pool.pod_allocated",
            Self::WarmPoolPodReleased => "warm_pool.pod_released",
            Self::WarmPoolScaled => "warm_pool.scaled",
        }
    }

    /// Category the event belongs to.
    pub fn category(&self) -> AuditCategory {
        match self {
            Self::PodCreated | Self::PodDeleted | Self::PodCreateFailed => AuditCategory::Pod,
            Self::NetworkPolicyCreated | Self::NetworkPolicyDeleted => {
                AuditCategory::NetworkPolicy
            }
            Self::RbacRoleCreated | Self::RbacRoleDeleted => AuditCategory::Rbac,
            Self::WarmPoolPodCreated
            | Self::WarmPoolPodAllocated
            | Self::WarmPoolPodReleased
            | Self::WarmPoolScaled => AuditCategory::WarmPool,
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub category: AuditCategory,
    pub resource_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AuditRecord {
    /// A successful event on `resource_name`.
    pub fn new(event_type: AuditEventType, resource_name: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            category: event_type.category(),
            resource_name: resource_name.into(),
            namespace: None,
            project_id: None,
            sandbox_id: None,
            success: true,
            error: None,
            details: BTreeMap::new(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn sandbox(mut self, sandbox_id: SandboxId) -> Self {
        self.sandbox_id = Some(sandbox_id);
        self
    }

    /// Mark the event as failed.
    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Single-line JSON form.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"eventType\":\"{}\",\"error\":\"audit serialization failed: {}\"}}",
                self.event_type, e
            )
        })
    }

    /// Write the record to the audit target.
    pub fn emit(&self) {
        tracing::info!(target: AUDIT_TARGET, "{}", self.to_json_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_vocabulary() {
        assert_eq!(
            AuditEventType::WarmPoolPodAllocated.as_str(),
            "warm_pool.pod_allocated"
        );
        let rbac = AuditEventType::RbacRoleCreated;
        assert_eq!(rbac.category(), AuditCategory::Rbac);
        assert_eq!(
            serde_json::to_value(AuditEventType::NetworkPolicyDeleted).unwrap(),
            "network_policy.deleted"
        );
    }

    #[test]
    fn test_record_is_single_line_json() {
        let record = AuditRecord::new(AuditEventType::PodCreated, "berth-abc")
            .namespace("sandboxes")
            .project("proj-a")
            .detail("image", "berth/agent:latest");
        let line = record.to_json_line();

        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["eventType"], "pod.created");
        assert_eq!(value["category"], "pod");
        assert_eq!(value["namespace"], "sandboxes");
        assert_eq!(value["details"]["image"], "berth/agent:latest");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_failed_record() {
        let record = AuditRecord::new(AuditEventType::PodCreateFailed, "berth-abc")
            .failed("exceeded quota");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "exceeded quota");
    }
}
