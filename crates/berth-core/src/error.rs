//! Error types for berth-core.

use crate::SandboxId;
use std::fmt;
use thiserror::Error;

/// Result type alias for berth-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An active sandbox is already mapped to the project.
    #[error("sandbox already exists for project {project_id}: {sandbox_id}")]
    AlreadyExists {
        /// Project the caller asked for.
        project_id: String,
        /// Sandbox currently mapped to it.
        sandbox_id: SandboxId,
    },

    /// Sandbox creation failed. `source` holds the underlying cause.
    #[error("failed to create sandbox for project {project_id}: {message}")]
    CreationFailed {
        /// Project the sandbox was created for.
        project_id: String,
        /// Message of the underlying cause.
        message: String,
        /// Underlying cause, when it was itself classified.
        #[source]
        source: Option<Box<CoreError>>,
    },

    /// The sandbox, container or pod does not exist.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A command inside the sandbox could not be run to completion.
    #[error("exec failed: {0}")]
    ExecFailed(String),

    /// The sandbox image could not be pulled.
    #[error("failed to pull image {image}: {message}")]
    ImagePullFailed {
        /// Image reference.
        image: String,
        /// Message from the runtime.
        message: String,
    },

    /// A tmux session with this name already exists in the sandbox.
    #[error("tmux session already exists: {0}")]
    SessionAlreadyExists(String),

    /// No tmux session with this name exists in the sandbox.
    #[error("tmux session not found: {0}")]
    SessionNotFound(String),

    /// The credentials file is not present in the sandbox.
    #[error("credentials not found at {0}")]
    CredentialsNotFound(String),

    /// The credentials file could not be written.
    #[error("credentials injection failed: {0}")]
    CredentialsInjectionFailed(String),

    /// Configuration rejected during validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime failure that fits no other kind.
    #[error("runtime error: {0}")]
    Runtime(#[from] berth_runtime::RuntimeError),
}

/// Stable classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`CoreError::AlreadyExists`].
    AlreadyExists,
    /// See [`CoreError::CreationFailed`].
    CreationFailed,
    /// See [`CoreError::ContainerNotFound`].
    ContainerNotFound,
    /// See [`CoreError::ExecFailed`].
    ExecFailed,
    /// See [`CoreError::ImagePullFailed`].
    ImagePullFailed,
    /// See [`CoreError::SessionAlreadyExists`].
    SessionAlreadyExists,
    /// See [`CoreError::SessionNotFound`].
    SessionNotFound,
    /// See [`CoreError::CredentialsNotFound`].
    CredentialsNotFound,
    /// See [`CoreError::CredentialsInjectionFailed`].
    CredentialsInjectionFailed,
    /// See [`CoreError::InvalidConfig`].
    InvalidConfig,
    /// See [`CoreError::Runtime`].
    Runtime,
}

impl ErrorKind {
    /// Stable code for logs and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::CreationFailed => "CREATION_FAILED",
            Self::ContainerNotFound => "CONTAINER_NOT_FOUND",
            Self::ExecFailed => "EXEC_FAILED",
            Self::ImagePullFailed => "IMAGE_PULL_FAILED",
            Self::SessionAlreadyExists => "SESSION_ALREADY_EXISTS",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::CredentialsNotFound => "CREDENTIALS_NOT_FOUND",
            Self::CredentialsInjectionFailed => "CREDENTIALS_INJECTION_FAILED",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::Runtime => "RUNTIME_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::CreationFailed { .. } => ErrorKind::CreationFailed,
            Self::ContainerNotFound(_) => ErrorKind::ContainerNotFound,
            Self::ExecFailed(_) => ErrorKind::ExecFailed,
            Self::ImagePullFailed { .. } => ErrorKind::ImagePullFailed,
            Self::SessionAlreadyExists(_) => ErrorKind::SessionAlreadyExists,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::CredentialsNotFound(_) => ErrorKind::CredentialsNotFound,
            Self::CredentialsInjectionFailed(_) => ErrorKind::CredentialsInjectionFailed,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Runtime(_) => ErrorKind::Runtime,
        }
    }

    /// Wrap a failure that happened while creating a sandbox.
    pub(crate) fn creation_failed(project_id: &str, cause: CoreError) -> Self {
        Self::CreationFailed {
            project_id: project_id.to_string(),
            message: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }

    /// Map a runtime error from an operation on an existing unit.
    ///
    /// A 404 means the unit vanished underneath us.
    pub(crate) fn from_unit(handle: &str, err: berth_runtime::RuntimeError) -> Self {
        if err.is_not_found() {
            Self::ContainerNotFound(handle.to_string())
        } else {
            Self::Runtime(err)
        }
    }

    /// Kind of the underlying cause of a [`CreationFailed`](Self::CreationFailed),
    /// or of this error itself.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            Self::CreationFailed {
                source: Some(cause),
                ..
            } => cause.root_kind(),
            other => other.kind(),
        }
    }
}
