//! Sandbox lifecycle events and their listeners.
//!
//! Listeners are called synchronously, in registration order, on the task
//! that triggered the event. A listener that returns an error or panics is
//! logged and skipped; the remaining listeners and the triggering operation
//! carry on.

use crate::sandbox::SandboxId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Listener = Arc<dyn Fn(&SandboxEvent) -> Result<(), ListenerError> + Send + Sync>;

/// A lifecycle event emitted by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    /// Creation started.
    Creating {
        /// Sandbox being created.
        sandbox_id: SandboxId,
        /// Owning project.
        project_id: String,
    },
    /// The runtime unit exists.
    Created {
        /// Sandbox id.
        sandbox_id: SandboxId,
        /// Owning project.
        project_id: String,
        /// Container id or pod name.
        runtime_handle: String,
    },
    /// The sandbox is running.
    Started {
        /// Sandbox id.
        sandbox_id: SandboxId,
        /// Owning project.
        project_id: String,
    },
    /// Creation failed.
    Error {
        /// Sandbox that failed.
        sandbox_id: SandboxId,
        /// Owning project.
        project_id: String,
        /// Failure message.
        message: String,
    },
}

impl SandboxEvent {
    /// Event name, e.g. `sandbox:created`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Creating { .. } => "sandbox:creating",
            Self::Created { .. } => "sandbox:created",
            Self::Started { .. } => "sandbox:started",
            Self::Error { .. } => "sandbox:error",
        }
    }

    /// Sandbox the event is about.
    pub fn sandbox_id(&self) -> SandboxId {
        match self {
            Self::Creating { sandbox_id, .. }
            | Self::Created { sandbox_id, .. }
            | Self::Started { sandbox_id, .. }
            | Self::Error { sandbox_id, .. } => *sandbox_id,
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Ordered set of event listeners.
#[derive(Default, Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned handle keeps the listener;
    /// call [`Subscription::unsubscribe`] to remove it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SandboxEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        tracing::trace!(listener_id = id, "Event listener registered");

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Dispatch an event to every listener in registration order.
    pub fn emit(&self, event: &SandboxEvent) {
        // Snapshot so listeners may (un)subscribe while being called.
        let listeners: Vec<(u64, Listener)> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.listeners.clone()
        };

        tracing::debug!(
            event = event.name(),
            sandbox_id = %event.sandbox_id(),
            listeners = listeners.len(),
            "Emitting sandbox event"
        );

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        listener_id = id,
                        event = event.name(),
                        error = %e,
                        "Event listener failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        listener_id = id,
                        event = event.name(),
                        "Event listener panicked"
                    );
                }
            }
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        let before = registry.listeners.len();
        registry.listeners.retain(|(id, _)| *id != self.id);
        before != registry.listeners.len()
    }
}
