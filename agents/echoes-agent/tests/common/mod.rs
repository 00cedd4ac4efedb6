//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream;
use std::collections::HashMap;
use std::sync::OnceLock;

use echoes_agent::crypto::Keypair;
use echoes_agent::runtime::adapter::{ContainerInfo, LogStream, LogsOptions, RuntimeAdapter};

pub fn agent_keypair() -> &'static Keypair {
    static KEY: OnceLock<Keypair> = OnceLock::new();
    KEY.get_or_init(|| Keypair::generate(1024).unwrap())
}

pub fn controller_keypair() -> &'static Keypair {
    static KEY: OnceLock<Keypair> = OnceLock::new();
    KEY.get_or_init(|| Keypair::generate(1024).unwrap())
}

/// A port nothing listens on
pub fn closed_port() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// Runtime with a fixed container list and finite log streams
#[derive(Default)]
pub struct FakeRuntime {
    containers: Vec<ContainerInfo>,
    logs: HashMap<String, Vec<String>>,
}

impl FakeRuntime {
    pub fn with_container(mut self, id: &str, name: &str, lines: &[&str]) -> Self {
        self.containers.push(ContainerInfo {
            id: id.to_string(),
            name: name.to_string(),
            names: vec![format!("/{name}")],
            image: format!("{name}:1.0"),
        });
        self.logs
            .insert(id.to_string(), lines.iter().map(|l| l.to_string()).collect());
        self
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    fn runtime_type(&self) -> &str {
        "fake"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn version(&self) -> Result<String> {
        Ok("fake".to_string())
    }

    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerInfo>> {
        Ok(self.containers.clone())
    }

    async fn stream_logs(&self, id: &str, _options: LogsOptions) -> Result<LogStream> {
        let lines = self
            .logs
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        Ok(Box::pin(stream::iter(lines.into_iter().map(Ok))))
    }
}
