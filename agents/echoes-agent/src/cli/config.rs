//! Configuration module
//!
//! Loads the optional TOML file, then applies command-line flags and their
//! environment fallbacks on top.

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::health::parse_bind_addr;
use crate::agent::monitor::DEFAULT_BATCH_SIZE;
use crate::connection::transport::{Endpoint, DEFAULT_HEALTH_PATH};
use crate::connection::websocket::ClientOptions;
use crate::crypto::{default_key_dir, DEFAULT_KEY_BITS};

/// Main configuration structure for the Echoes Agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity and key material
    #[serde(default)]
    pub agent: AgentConfig,

    /// Controller connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The agent's own health endpoint
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,

    /// Reconnect policy
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Shared session token, takes precedence over `secret_file`
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,

    /// File holding the session token
    #[serde(default)]
    pub secret_file: Option<PathBuf>,

    /// Hostname reported to the controller
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Where the RSA keypair is persisted
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Controller `host:port`
    #[serde(default = "default_server_address")]
    pub address: String,

    #[serde(default)]
    pub tls: bool,

    /// Development deployments serve `/ws` instead of `/api/ws`
    #[serde(default)]
    pub development: bool,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keep-alive ping interval
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address, `:port` binds all interfaces
    #[serde(default = "default_healthcheck_addr")]
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds since start after which reconnecting stops
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,

    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Lines per log batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches buffered before monitor tasks wait on the connection
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Docker socket path, local defaults when unset
    #[serde(default)]
    pub docker_socket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

/// Flags that override the file, each with an environment fallback
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Controller address (host:port)
    #[arg(long, env = "ECHOES_SERVER")]
    pub server: Option<String>,

    /// Shared session token
    #[arg(long = "agent-secret", env = "ECHOES_AGENT_SECRET", hide_env_values = true)]
    pub agent_secret: Option<String>,

    /// File holding the session token
    #[arg(long = "agent-secret-file", env = "ECHOES_AGENT_SECRET_FILE")]
    pub agent_secret_file: Option<PathBuf>,

    /// Hostname reported to the controller
    #[arg(long, env = "ECHOES_HOSTNAME")]
    pub hostname: Option<String>,

    /// Serve the agent health endpoint
    #[arg(
        long,
        env = "ECHOES_HEALTHCHECK",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub healthcheck: Option<bool>,

    /// Health endpoint bind address
    #[arg(long = "healthcheck-addr", env = "ECHOES_HEALTHCHECK_ADDR")]
    pub healthcheck_addr: Option<String>,

    /// Use wss/https
    #[arg(
        long,
        env = "ECHOES_TLS",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub tls: Option<bool>,

    /// Development path layout
    #[arg(
        long,
        env = "ECHOES_DEVELOPMENT",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub development: Option<bool>,

    /// Key persistence directory
    #[arg(long = "key-dir", env = "ECHOES_KEY_DIR")]
    pub key_dir: Option<PathBuf>,
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_key_bits() -> usize {
    DEFAULT_KEY_BITS
}

fn default_server_address() -> String {
    "localhost:8080".to_string()
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_ping_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_healthcheck_addr() -> String {
    ":5000".to_string()
}

fn default_retry_budget() -> u64 {
    60
}

fn default_backoff() -> u64 {
    5
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_queue_capacity() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_file: None,
            hostname: default_hostname(),
            key_dir: default_key_dir(),
            key_bits: default_key_bits(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            tls: false,
            development: false,
            health_path: default_health_path(),
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            addr: default_healthcheck_addr(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retry_budget_secs: default_retry_budget(),
            backoff_secs: default_backoff(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// File (or defaults when no path is given) plus overrides
    pub fn resolve(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(server) = &overrides.server {
            self.server.address = server.clone();
        }
        if let Some(secret) = &overrides.agent_secret {
            self.agent.secret = Some(secret.clone());
        }
        if let Some(file) = &overrides.agent_secret_file {
            self.agent.secret_file = Some(file.clone());
        }
        if let Some(hostname) = &overrides.hostname {
            self.agent.hostname = hostname.clone();
        }
        if let Some(enabled) = overrides.healthcheck {
            self.healthcheck.enabled = enabled;
        }
        if let Some(addr) = &overrides.healthcheck_addr {
            self.healthcheck.addr = addr.clone();
        }
        if let Some(tls) = overrides.tls {
            self.server.tls = tls;
        }
        if let Some(development) = overrides.development {
            self.server.development = development;
        }
        if let Some(dir) = &overrides.key_dir {
            self.agent.key_dir = dir.clone();
        }
    }

    /// The session token: inline secret first, then the trimmed secret file
    pub fn session_token(&self) -> Result<String> {
        if let Some(secret) = self.agent.secret.as_deref().map(str::trim) {
            if !secret.is_empty() {
                return Ok(secret.to_string());
            }
        }

        if let Some(path) = &self.agent.secret_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read secret file: {}", path.display()))?;
            let token = content.trim();
            if token.is_empty() {
                bail!("Secret file is empty: {}", path.display());
            }
            return Ok(token.to_string());
        }

        bail!("No agent secret configured; set ECHOES_AGENT_SECRET or ECHOES_AGENT_SECRET_FILE")
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.server.address, self.server.tls, self.server.development)
            .with_health_path(&self.server.health_path)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            retry_budget: Duration::from_secs(self.lifecycle.retry_budget_secs),
            backoff: Duration::from_secs(self.lifecycle.backoff_secs),
            connect_timeout: Duration::from_secs(self.server.connect_timeout_secs),
            ping_interval: Duration::from_secs(self.server.ping_interval_secs.max(1)),
            batch_size: self.monitor.batch_size.max(1),
            batch_queue: self.monitor.queue_capacity.max(1),
        }
    }

    pub fn healthcheck_addr(&self) -> Result<SocketAddr> {
        parse_bind_addr(&self.healthcheck.addr)
    }
}
