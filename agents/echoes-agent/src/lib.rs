//! Echoes Agent Library
//!
//! This crate provides the core functionality for the Echoes host agent:
//! the encrypted controller session, the container log monitor engine, and
//! the reconnect lifecycle around them.

pub mod agent;
pub mod cli;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod runtime;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use agent::session::{AgentIdentity, Session};
pub use agent::state::{LifecycleManager, LifecycleState};
pub use cli::config::Config;
pub use connection::protocol::{Envelope, InboundEvent};
pub use connection::websocket::{ExitReason, WebSocketClient, WebSocketClientBuilder};
pub use runtime::adapter::RuntimeAdapter;
pub use runtime::docker::DockerAdapter;
