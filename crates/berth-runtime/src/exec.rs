//! Exec request and output types shared by the container and pod runtimes.

use crate::error::RuntimeError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::fmt;

/// Which output stream a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One demultiplexed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Stream the payload was written to.
    pub kind: StreamKind,
    /// Raw payload bytes.
    pub data: Bytes,
}

impl OutputChunk {
    /// Create a stdout chunk.
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Stdout,
            data: data.into(),
        }
    }

    /// Create a stderr chunk.
    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Parameters of a single exec call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    /// Command and arguments, not interpreted by a shell.
    pub command: Vec<String>,
    /// Attach standard output.
    pub attach_stdout: bool,
    /// Attach standard error.
    pub attach_stderr: bool,
    /// Effective user, `None` for the image default.
    pub user: Option<String>,
    /// Environment entries in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory inside the sandbox.
    pub working_dir: Option<String>,
}

impl ExecSpec {
    /// Exec spec attaching both output streams.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            attach_stdout: true,
            attach_stderr: true,
            ..Default::default()
        }
    }
}

/// Live output of a started exec.
///
/// `chunks` ends when the process closes its output. `exit_code` resolves
/// after that; `None` means the runtime did not report a code.
pub struct ExecOutput {
    /// Demultiplexed output in arrival order.
    pub chunks: BoxStream<'static, Result<OutputChunk, RuntimeError>>,
    /// Exit code of the process.
    pub exit_code: BoxFuture<'static, Result<Option<i64>, RuntimeError>>,
}

impl fmt::Debug for ExecOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecOutput").finish_non_exhaustive()
    }
}
