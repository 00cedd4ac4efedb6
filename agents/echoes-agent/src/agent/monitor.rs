//! Monitor Engine
//!
//! Resolves monitor directives to live containers and tails each match in
//! its own task. Lines are grouped into fixed-size batches which are handed
//! to the session over a channel; the session is the only writer on the
//! controller connection.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::connection::protocol::MonitorDirective;
use crate::runtime::adapter::{ContainerInfo, LogsOptions, RuntimeAdapter};

/// Lines per batch
pub const DEFAULT_BATCH_SIZE: usize = 1500;

/// A group of log lines from one container, ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    pub monitor_id: i64,
    pub container_name: String,
    pub lines: Vec<String>,
}

/// Where a task starts reading in the log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCursor {
    /// The full backlog, then the live output
    FromStart,
}

impl LogCursor {
    fn logs_options(self) -> LogsOptions {
        match self {
            LogCursor::FromStart => LogsOptions::follow_all(),
        }
    }
}

/// One container being tailed for one directive
#[derive(Debug, Clone)]
pub struct MonitorTask {
    pub monitor_id: i64,
    pub container_id: String,
    pub container_name: String,
    pub cursor: LogCursor,
}

/// Fixed-capacity line accumulator
#[derive(Debug)]
pub struct Batcher {
    capacity: usize,
    lines: Vec<String>,
}

impl Batcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Vec::with_capacity(capacity),
        }
    }

    /// Add a line; returns a full batch once capacity is reached
    pub fn push(&mut self, line: String) -> Option<Vec<String>> {
        self.lines.push(line);
        if self.lines.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.lines,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// Remaining lines at stream end, if any
    pub fn finish(self) -> Option<Vec<String>> {
        if self.lines.is_empty() {
            None
        } else {
            Some(self.lines)
        }
    }
}

/// Starts and runs log-tailing tasks for monitor directives
pub struct MonitorEngine<R: RuntimeAdapter + 'static> {
    runtime: Arc<R>,
    batch_size: usize,
    batch_tx: mpsc::Sender<LogBatch>,
}

impl<R: RuntimeAdapter + 'static> MonitorEngine<R> {
    pub fn new(runtime: Arc<R>, batch_size: usize, batch_tx: mpsc::Sender<LogBatch>) -> Self {
        Self {
            runtime,
            batch_size,
            batch_tx,
        }
    }

    /// Resolve directives against the live containers, one task per
    /// (directive, matching container).
    ///
    /// Fails only when the containers cannot be listed. A directive with an
    /// invalid pattern is skipped; a directive matching nothing plans nothing.
    pub async fn plan(&self, directives: &[MonitorDirective]) -> Result<Vec<MonitorTask>> {
        let containers = self
            .runtime
            .list_containers(false)
            .await
            .context("Failed to list containers")?;

        let mut planned = Vec::new();
        for directive in directives {
            let pattern = match Regex::new(&directive.pattern) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!(
                        monitor_id = directive.id,
                        pattern = %directive.pattern,
                        error = %e,
                        "Invalid monitor pattern, skipping directive"
                    );
                    continue;
                }
            };

            let matches = select_matching(&containers, &pattern);
            if matches.is_empty() {
                info!(monitor_id = directive.id, pattern = %directive.pattern, "No containers match");
                continue;
            }

            planned.extend(matches.into_iter().map(|container| MonitorTask {
                monitor_id: directive.id,
                container_id: container.id,
                container_name: container.name,
                cursor: LogCursor::FromStart,
            }));
        }

        Ok(planned)
    }

    /// Spawn the planned tasks into `tasks`, returning how many started
    pub fn spawn(&self, planned: Vec<MonitorTask>, tasks: &mut JoinSet<()>) -> usize {
        let count = planned.len();
        for task in planned {
            info!(
                monitor_id = task.monitor_id,
                container = %task.container_name,
                "Monitoring logs for container"
            );
            tasks.spawn(tail(
                self.runtime.clone(),
                task,
                self.batch_size,
                self.batch_tx.clone(),
            ));
        }
        count
    }
}

fn select_matching(containers: &[ContainerInfo], pattern: &Regex) -> Vec<ContainerInfo> {
    containers
        .iter()
        .filter(|container| {
            let matched = pattern.is_match(&container.name);
            if !matched {
                debug!(container = %container.name, "Skipping container");
            }
            matched
        })
        .cloned()
        .collect()
}

/// Follow one container's logs until the stream ends
async fn tail<R: RuntimeAdapter + 'static>(
    runtime: Arc<R>,
    task: MonitorTask,
    batch_size: usize,
    batch_tx: mpsc::Sender<LogBatch>,
) {
    let mut stream = match runtime
        .stream_logs(&task.container_id, task.cursor.logs_options())
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            error!(container = %task.container_name, error = %e, "Error getting logs for container");
            return;
        }
    };

    let mut batcher = Batcher::new(batch_size);
    while let Some(line) = stream.next().await {
        match line {
            Ok(line) => {
                if let Some(lines) = batcher.push(line) {
                    if !deliver(&batch_tx, &task, lines).await {
                        return;
                    }
                }
            }
            Err(e) => {
                error!(container = %task.container_name, error = %e, "Error reading log stream");
                break;
            }
        }
    }

    if let Some(lines) = batcher.finish() {
        deliver(&batch_tx, &task, lines).await;
    }
    debug!(container = %task.container_name, monitor_id = task.monitor_id, "Log stream ended");
}

/// Returns false once the session is gone
async fn deliver(batch_tx: &mpsc::Sender<LogBatch>, task: &MonitorTask, lines: Vec<String>) -> bool {
    let batch = LogBatch {
        monitor_id: task.monitor_id,
        container_name: task.container_name.clone(),
        lines,
    };
    if batch_tx.send(batch).await.is_err() {
        debug!(container = %task.container_name, "Session closed, dropping log batch");
        return false;
    }
    true
}
