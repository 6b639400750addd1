//! Error types for berth-runtime.

use thiserror::Error;

/// Result type alias for berth-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors returned by the container and pod runtime clients.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime API answered with a non-success status.
    #[error("runtime API error {status}: {message}")]
    Api {
        /// HTTP status code returned by the runtime.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// The runtime could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A request could not be built from the given input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The exec stream broke before it ended.
    #[error("exec stream error: {0}")]
    Stream(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kubernetes client error that is not an API status.
    #[error("kubernetes client error: {0}")]
    Kube(String),
}

impl RuntimeError {
    /// Build an API error from a status code and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// True if the runtime reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// True if the runtime rejected a write because the object changed
    /// underneath it (stale resource version) or is already in use.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { status: 409, .. })
    }
}

impl From<hyper::Error> for RuntimeError {
    fn from(e: hyper::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<kube::Error> for RuntimeError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => Self::Api {
                status: resp.code,
                message: resp.message,
            },
            other => Self::Kube(other.to_string()),
        }
    }
}
