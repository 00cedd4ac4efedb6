//! Runtime Adapter Trait
//!
//! Defines the interface the agent needs from a container runtime: listing
//! live containers and following their logs.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Container information returned by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    /// Primary name without the leading `/`
    pub name: String,
    /// All names as reported by the runtime
    pub names: Vec<String>,
    pub image: String,
}

/// Container logs options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogsOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub follow: bool,
    /// Number of backlog lines, `None` for the whole backlog
    pub tail: Option<usize>,
}

impl LogsOptions {
    /// Both streams, the whole backlog, then follow the live output
    pub fn follow_all() -> Self {
        Self {
            stdout: true,
            stderr: true,
            follow: true,
            tail: None,
        }
    }
}

/// Lazy sequence of log lines; ends when the container stops or on error
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Runtime adapter trait - common interface for all container runtimes
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Get the runtime type name
    fn runtime_type(&self) -> &str;

    /// Check if the runtime is available and healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get runtime version information
    async fn version(&self) -> Result<String>;

    /// List containers, only running ones unless `all` is set
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    /// Open a log stream for a container
    async fn stream_logs(&self, id: &str, options: LogsOptions) -> Result<LogStream>;
}
