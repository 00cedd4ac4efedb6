//! Echoes Agent CLI Entry Point
//!
//! This is the main entry point for the Echoes Agent binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use echoes_agent::agent::health::serve_health;
use echoes_agent::agent::session::AgentIdentity;
use echoes_agent::agent::state::LifecycleManager;
use echoes_agent::cli::config::{Config, ConfigOverrides};
use echoes_agent::connection::transport::probe_health;
use echoes_agent::connection::websocket::{ExitReason, WebSocketClient};
use echoes_agent::crypto::{FileKeyStore, Keypair};
use echoes_agent::logging;
use echoes_agent::runtime::adapter::RuntimeAdapter;
use echoes_agent::runtime::docker::DockerAdapter;

#[derive(Parser)]
#[command(name = "echoes-agent")]
#[command(author, version, about = "Echoes Agent - Ships container logs to the Echoes controller")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ECHOES_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start,
    /// Show agent status
    Status,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        show_version();
        return Ok(());
    }

    let config = Config::resolve(cli.config.as_deref(), &cli.overrides)?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    logging::init(level, config.logging.format)?;

    match cli.command {
        Commands::Start => start_agent(config).await,
        Commands::Status => show_status(&config).await,
        Commands::Version => Ok(()),
    }
}

fn connect_docker(config: &Config) -> Result<DockerAdapter> {
    match &config.runtime.docker_socket {
        Some(socket) => DockerAdapter::with_socket(socket),
        None => DockerAdapter::new(),
    }
}

async fn start_agent(config: Config) -> Result<()> {
    info!("Starting Echoes Agent...");

    // Everything that can fail locally happens before any network activity
    let token = config.session_token()?;
    let store = FileKeyStore::new(&config.agent.key_dir);
    let keypair = Keypair::load_or_generate(&store, config.agent.key_bits)
        .with_context(|| format!("Failed to load key material from {}", store.dir().display()))?;
    info!(key_dir = %store.dir().display(), "Key material ready");

    let docker = connect_docker(&config).context("Failed to initialize Docker adapter")?;
    if !docker.health_check().await? {
        anyhow::bail!("Docker is not responding on {}", docker.socket_path());
    }
    let version = docker.version().await.context("Failed to get Docker version")?;
    info!(
        runtime = docker.runtime_type(),
        socket = docker.socket_path(),
        version = %version,
        "Container runtime initialized"
    );
    let runtime = Arc::new(docker);

    let lifecycle = LifecycleManager::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let health = if config.healthcheck.enabled {
        let addr = config.healthcheck_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health endpoint on {addr}"))?;
        let lifecycle = lifecycle.clone();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = serve_health(listener, lifecycle, shutdown).await {
                error!(error = %e, "Health endpoint failed");
            }
        }))
    } else {
        None
    };

    let identity = AgentIdentity::new(&token, &config.agent.hostname, Arc::new(keypair));
    let mut client = WebSocketClient::new(config.endpoint(), identity, runtime, lifecycle)
        .with_options(config.client_options());

    info!(
        server = %config.server.address,
        hostname = %config.agent.hostname,
        "Connecting to controller"
    );
    let reason = client.run(shutdown_rx).await.context("Controller is not ready")?;

    match reason {
        ExitReason::Shutdown => info!("Agent stopped"),
        ExitReason::RetryBudgetExhausted => warn!("Agent stopped after exhausting its retry budget"),
    }

    if let Some(health) = health {
        health.abort();
    }

    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn show_status(config: &Config) -> Result<()> {
    println!("Agent Status: checking...");

    match connect_docker(config) {
        Ok(docker) => {
            println!("  Runtime: {} via {}", docker.runtime_type(), docker.socket_path());
            match docker.health_check().await {
                Ok(true) => match docker.version().await {
                    Ok(version) => println!("  Docker: {} (connected)", version),
                    Err(e) => println!("  Docker: error - {}", e),
                },
                _ => println!("  Docker: not responding"),
            }

            match docker.list_containers(false).await {
                Ok(containers) => println!("  Running containers: {}", containers.len()),
                Err(_) => println!("  Running containers: unknown"),
            }
        }
        Err(e) => println!("  Docker: not available - {}", e),
    }

    let url = config.endpoint().health_url();
    match probe_health(&reqwest::Client::new(), &url).await {
        Ok(()) => println!("  Controller: ready ({})", url),
        Err(e) => println!("  Controller: {}", e),
    }

    Ok(())
}

fn show_version() {
    println!("echoes-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Host agent for the Echoes log collector");
    println!();
    println!("Features:");
    println!("  - RSA-sealed payloads over a WebSocket session");
    println!("  - Regex-selected Docker container log tailing");
    println!("  - Batched log delivery");
    println!("  - Bounded reconnect with fixed backoff");
}
