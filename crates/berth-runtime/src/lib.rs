//! # berth-runtime
//!
//! Runtime layer for berth sandboxes.
//! Talks to the systems that actually host sandboxes: the Docker Engine on a
//! single host, or a Kubernetes cluster.
//!
//! ## Quick Start
//!
//! ```no_run
//! use berth_runtime::{demux_stream, ContainerRuntime, DockerEngine, ExecSpec};
//! use futures::StreamExt;
//!
//! # async fn example() -> berth_runtime::Result<()> {
//! let engine = DockerEngine::local();
//!
//! let spec = ExecSpec::new(vec!["uname".into(), "-a".into()]);
//! let exec_id = engine.exec_create("my-container", &spec).await?;
//! let mut output = demux_stream(engine.exec_start(&exec_id).await?);
//!
//! while let Some(chunk) = output.next().await {
//!     let chunk = chunk?;
//!     println!("{}: {}", chunk.kind, String::from_utf8_lossy(&chunk.data));
//! }
//!
//! let exit_code = engine.exec_inspect(&exec_id).await?.exit_code.unwrap_or(0);
//! println!("exit code {exit_code}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Frame Demultiplexing**: Incremental parser for the multiplexed exec stream
//! - **Docker Engine**: Containers, images, stats and exec over the Unix socket
//! - **Kubernetes Pods**: Label-selected pods, conditional label patches and exec
//! - **Runtime Traits**: `ContainerRuntime` and `PodRuntime` seams for the core

mod demux;
mod docker;
mod error;
mod exec;
mod kubernetes;
mod pods;

pub use demux::{demux_stream, FrameDemuxer, HEADER_LEN};
pub use docker::{
    ContainerRuntime, ContainerSpec, ContainerStats, ContainerSummary, DockerEngine, ExecInspect,
    DEFAULT_DOCKER_SOCKET,
};
pub use error::{Result, RuntimeError};
pub use exec::{ExecOutput, ExecSpec, OutputChunk, StreamKind};
pub use kubernetes::KubePods;
pub use pods::{wrap_pod_command, HostMount, PodRuntime, PodSnapshot, PodTemplate};
