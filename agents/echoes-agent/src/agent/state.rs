//! Lifecycle State Management
//!
//! Tracks the process-wide lifecycle (probe, connect, run, back off) and the
//! identity the controller assigned in the current session.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Represents the lifecycle states of the agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Checking that the controller is ready
    Probing,
    /// Opening the websocket
    Connecting,
    /// Session established, receive loop running
    Running,
    /// Waiting before the next connection attempt
    Backoff,
    /// Shut down or retry budget exhausted
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Probing => write!(f, "Probing"),
            LifecycleState::Connecting => write!(f, "Connecting"),
            LifecycleState::Running => write!(f, "Running"),
            LifecycleState::Backoff => write!(f, "Backoff"),
            LifecycleState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// State transition information
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Point-in-time view for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    #[serde(rename = "agentId")]
    pub agent_id: Option<i64>,
    #[serde(rename = "connectionAttempts")]
    pub connection_attempts: u32,
    #[serde(rename = "lastConnected")]
    pub last_connected: Option<DateTime<Utc>>,
}

/// Internal state data
struct LifecycleInner {
    current: LifecycleState,
    agent_id: Option<i64>,
    last_connected: Option<DateTime<Utc>>,
    connection_attempts: u32,
    transitions: Vec<StateTransition>,
}

/// Thread-safe lifecycle manager
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<RwLock<LifecycleInner>>,
}

impl LifecycleManager {
    /// Create a new manager starting in Probing state
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LifecycleInner {
                current: LifecycleState::Probing,
                agent_id: None,
                last_connected: None,
                connection_attempts: 0,
                transitions: Vec::new(),
            })),
        }
    }

    /// Get the current state
    pub fn current_state(&self) -> LifecycleState {
        self.inner.read().current
    }

    /// Get the last connected timestamp
    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_connected
    }

    /// Connection attempts since the last successful connection
    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    /// Id assigned by the controller in the current session
    pub fn agent_id(&self) -> Option<i64> {
        self.inner.read().agent_id
    }

    /// Publish the id assigned in the current session (`None` clears it)
    pub fn set_agent_id(&self, agent_id: Option<i64>) {
        self.inner.write().agent_id = agent_id;
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let inner = self.inner.read();
        LifecycleSnapshot {
            state: inner.current,
            agent_id: inner.agent_id,
            connection_attempts: inner.connection_attempts,
            last_connected: inner.last_connected,
        }
    }

    /// Transition to a new state
    pub fn transition_to(&self, new_state: LifecycleState, reason: Option<String>) -> bool {
        let mut inner = self.inner.write();

        if !Self::is_valid_transition(inner.current, new_state) {
            tracing::warn!(from = %inner.current, to = %new_state, "Rejected lifecycle transition");
            return false;
        }

        let transition = StateTransition {
            from: inner.current,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        };

        let old_state = inner.current;
        inner.current = new_state;

        match new_state {
            LifecycleState::Running => {
                inner.last_connected = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            LifecycleState::Connecting => {
                inner.connection_attempts += 1;
            }
            LifecycleState::Backoff | LifecycleState::Terminated => {
                inner.agent_id = None;
            }
            LifecycleState::Probing => {}
        }

        inner.transitions.push(transition);

        // Keep only last 100 transitions
        if inner.transitions.len() > 100 {
            inner.transitions.remove(0);
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            attempts = inner.connection_attempts,
            "Lifecycle transition"
        );

        true
    }

    /// Check if a state transition is valid
    fn is_valid_transition(from: LifecycleState, to: LifecycleState) -> bool {
        if from == to {
            return true;
        }

        matches!(
            (from, to),
            (LifecycleState::Probing, LifecycleState::Connecting) |
            (LifecycleState::Probing, LifecycleState::Terminated) |
            (LifecycleState::Connecting, LifecycleState::Running) |
            (LifecycleState::Connecting, LifecycleState::Backoff) |
            (LifecycleState::Connecting, LifecycleState::Terminated) |
            (LifecycleState::Running, LifecycleState::Backoff) |
            (LifecycleState::Running, LifecycleState::Terminated) |
            (LifecycleState::Backoff, LifecycleState::Connecting) |
            (LifecycleState::Backoff, LifecycleState::Terminated)
        )
    }

    pub fn set_connecting(&self) {
        self.transition_to(LifecycleState::Connecting, Some("Opening connection".to_string()));
    }

    pub fn set_running(&self) {
        self.transition_to(LifecycleState::Running, Some("Connection established".to_string()));
    }

    pub fn set_backoff(&self, reason: Option<String>) {
        self.transition_to(LifecycleState::Backoff, reason);
    }

    pub fn set_terminated(&self, reason: &str) {
        self.transition_to(LifecycleState::Terminated, Some(reason.to_string()));
    }

    /// Get recent state transitions
    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        let inner = self.inner.read();
        inner.transitions.iter().rev().take(count).cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.current_state() == LifecycleState::Running
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}
