//! Shared test doubles.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::crypto::Keypair;
use crate::runtime::adapter::{ContainerInfo, LogStream, LogsOptions, RuntimeAdapter};

/// Key generation is slow, so every test shares the same two keys
pub fn agent_keypair() -> &'static Keypair {
    static KEY: OnceLock<Keypair> = OnceLock::new();
    KEY.get_or_init(|| Keypair::generate(1024).unwrap())
}

pub fn controller_keypair() -> &'static Keypair {
    static KEY: OnceLock<Keypair> = OnceLock::new();
    KEY.get_or_init(|| Keypair::generate(1024).unwrap())
}

pub fn container(id: &str, name: &str) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: name.to_string(),
        names: vec![format!("/{name}")],
        image: format!("{name}:latest"),
    }
}

/// Runtime with scripted containers and log streams.
///
/// Streams are finite unless marked endless. Opening a stream for a
/// container without scripted logs fails.
#[derive(Default)]
pub struct MockRuntime {
    containers: Vec<ContainerInfo>,
    logs: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    endless: HashSet<String>,
    list_error: AtomicBool,
    opened: AtomicUsize,
    requested: Mutex<Vec<LogsOptions>>,
}

impl MockRuntime {
    pub fn new(containers: Vec<ContainerInfo>) -> Self {
        Self {
            containers,
            ..Default::default()
        }
    }

    pub fn with_logs(mut self, id: &str, lines: Vec<String>) -> Self {
        self.logs.insert(id.to_string(), lines);
        self
    }

    /// The stream for `id` yields an error after its scripted lines
    pub fn failing_after(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    /// The stream for `id` stays open after its scripted lines
    pub fn endless_after(mut self, id: &str) -> Self {
        self.endless.insert(id.to_string());
        self
    }

    pub fn with_list_error(self) -> Self {
        self.set_list_error(true);
        self
    }

    pub fn set_list_error(&self, failing: bool) {
        self.list_error.store(failing, Ordering::SeqCst);
    }

    pub fn streams_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn requested_options(&self) -> Vec<LogsOptions> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl RuntimeAdapter for MockRuntime {
    fn runtime_type(&self) -> &str {
        "mock"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn version(&self) -> Result<String> {
        Ok("mock 1.0".to_string())
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerInfo>> {
        if self.list_error.load(Ordering::SeqCst) {
            return Err(anyhow!("runtime unavailable"));
        }
        Ok(self.containers.clone())
    }

    async fn stream_logs(&self, id: &str, options: LogsOptions) -> Result<LogStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().push(options);

        let lines = self
            .logs
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no such container: {id}"))?;

        let mut items: Vec<Result<String>> = lines.into_iter().map(Ok).collect();
        if self.failing.contains(id) {
            items.push(Err(anyhow!("log stream interrupted")));
        }
        if self.endless.contains(id) {
            return Ok(Box::pin(stream::iter(items).chain(stream::pending())));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}
