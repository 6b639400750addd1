//! # berth-daemon
//!
//! Host daemon for Berth sandboxes.
//!
//! The daemon adopts sandboxes left running by a previous instance, keeps the
//! warm pool topped up when running against a cluster, and serves a small
//! read-only HTTP API for status and reaping.
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run -p berth-daemon
//! ```
//!
//! Run against a cluster with a warm pool:
//!
//! ```bash
//! export BERTH_RUNTIME=cluster
//! export BERTH_NAMESPACE=sandboxes
//! export BERTH_IMAGE=berth/agent:latest
//! export BERTH_POOL_ENABLED=true
//! cargo run -p berth-daemon
//! ```

pub mod http;

mod config;
mod server;

pub use config::{ConfigError, DaemonConfig, RuntimeKind};
pub use server::Daemon;
