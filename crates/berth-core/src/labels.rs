//! Label keys shared by backends and the warm pool.

/// Default label namespace.
pub const DEFAULT_LABEL_PREFIX: &str = "berth.dev";

/// Label keys under one namespace, e.g. `berth.dev/sandbox`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    prefix: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL_PREFIX)
    }
}

impl Labels {
    /// Keys under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The namespace.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Marks every unit managed by berth (`true`).
    pub fn sandbox(&self) -> String {
        self.key("sandbox")
    }

    /// Marks warm pool members (`true`).
    pub fn warm_pool(&self) -> String {
        self.key("warm-pool")
    }

    /// Pool state, `warm` or `allocated`.
    pub fn warm_pool_state(&self) -> String {
        self.key("warm-pool-state")
    }

    /// Pool a unit belongs to.
    pub fn pool_id(&self) -> String {
        self.key("pool-id")
    }

    /// Project a unit is allocated to.
    pub fn project_id(&self) -> String {
        self.key("project-id")
    }

    /// Sandbox a unit hosts.
    pub fn sandbox_id(&self) -> String {
        self.key("sandbox-id")
    }

    /// Selector matching sandbox units that host a sandbox.
    pub fn sandbox_selector(&self) -> String {
        format!("{}=true,{}", self.sandbox(), self.sandbox_id())
    }

    /// Selector matching members of one warm pool.
    pub fn pool_selector(&self, pool_id: &str) -> String {
        format!("{}=true,{}={}", self.warm_pool(), self.pool_id(), pool_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keys() {
        let labels = Labels::default();
        assert_eq!(labels.sandbox(), "berth.dev/sandbox");
        assert_eq!(labels.warm_pool_state(), "berth.dev/warm-pool-state");
        assert_eq!(
            labels.pool_selector("p1"),
            "berth.dev/warm-pool=true,berth.dev/pool-id=p1"
        );
    }

    #[test]
    fn test_custom_prefix() {
        let labels = Labels::new("acme.io");
        assert_eq!(labels.project_id(), "acme.io/project-id");
        assert_eq!(
            labels.sandbox_selector(),
            "acme.io/sandbox=true,acme.io/sandbox-id"
        );
    }
}
