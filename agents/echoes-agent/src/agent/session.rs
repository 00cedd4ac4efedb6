//! Controller Session
//!
//! The protocol state machine for one controller connection. It owns the
//! session half of the agent identity (peer key, assigned id), decodes each
//! inbound frame into a typed event and produces the reply envelope, sealing
//! confidential payloads with the controller's public key.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::agent::monitor::{LogBatch, MonitorEngine};
use crate::agent::state::LifecycleManager;
use crate::connection::protocol::{
    events, AgentIdPayload, AgentInfoPayload, ContainerSummary, Envelope, InboundEvent, LogPayload,
    MonitorDirective, SealedPayload,
};
use crate::crypto::{Keypair, PeerKey};
use crate::error::SessionError;
use crate::runtime::adapter::RuntimeAdapter;

/// Where the session is in the key exchange / registration sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No peer key, no assigned id
    Unidentified,
    /// Controller public key received
    KeyExchanged,
    /// Controller assigned an id
    Registered,
}

/// Who the agent is, and what the current session has learned
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    session_token: String,
    hostname: String,
    keypair: Arc<Keypair>,
    assigned_id: Option<i64>,
    peer_key: Option<PeerKey>,
}

impl AgentIdentity {
    pub fn new(session_token: &str, hostname: &str, keypair: Arc<Keypair>) -> Self {
        Self {
            session_token: session_token.to_string(),
            hostname: hostname.to_string(),
            keypair,
            assigned_id: None,
            peer_key: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.assigned_id.is_some() {
            SessionState::Registered
        } else if self.peer_key.is_some() {
            SessionState::KeyExchanged
        } else {
            SessionState::Unidentified
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn assigned_id(&self) -> Option<i64> {
        self.assigned_id
    }

    pub fn peer_key(&self) -> Option<&PeerKey> {
        self.peer_key.as_ref()
    }

    /// Forget everything learned during a session; keys and token persist
    pub fn reset_session(&mut self) {
        self.assigned_id = None;
        self.peer_key = None;
    }

    /// A copy with empty session state, for a new connection
    pub fn for_new_session(&self) -> Self {
        let mut identity = self.clone();
        identity.reset_session();
        identity
    }
}

/// One controller session
pub struct Session<R: RuntimeAdapter + 'static> {
    identity: AgentIdentity,
    runtime: Arc<R>,
    lifecycle: LifecycleManager,
    engine: MonitorEngine<R>,
    monitors: JoinSet<()>,
}

impl<R: RuntimeAdapter + 'static> Session<R> {
    /// Create a session; monitor tasks deliver their batches on `batch_tx`
    pub fn new(
        identity: AgentIdentity,
        runtime: Arc<R>,
        lifecycle: LifecycleManager,
        batch_size: usize,
        batch_tx: mpsc::Sender<LogBatch>,
    ) -> Self {
        let engine = MonitorEngine::new(runtime.clone(), batch_size, batch_tx);
        Self {
            identity,
            runtime,
            lifecycle,
            engine,
            monitors: JoinSet::new(),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.identity.state()
    }

    /// Number of monitor tasks not yet reaped
    pub fn active_monitors(&self) -> usize {
        self.monitors.len()
    }

    pub fn has_monitors(&self) -> bool {
        !self.monitors.is_empty()
    }

    /// Wait for the next monitor task to end; `None` when there are none
    pub async fn join_monitor(&mut self) -> Option<()> {
        match self.monitors.join_next().await? {
            Err(e) if e.is_panic() => error!(error = %e, "Monitor task panicked"),
            _ => {}
        }
        Some(())
    }

    /// Decode and handle one text frame
    pub async fn handle_frame(&mut self, text: &str) -> Result<Option<Envelope>, SessionError> {
        let event = InboundEvent::from_json(text)?;
        self.handle_event(event).await
    }

    /// Handle one inbound event, returning the reply to send, if any
    pub async fn handle_event(
        &mut self,
        event: InboundEvent,
    ) -> Result<Option<Envelope>, SessionError> {
        match event {
            InboundEvent::Handshake(payload) => {
                let peer = PeerKey::from_pem(&payload.public_key)?;
                self.identity.peer_key = Some(peer);
                info!("Received controller public key");
                Ok(Some(Envelope::handshake(self.identity.keypair.public_key_pem())))
            }
            InboundEvent::AgentInfo => {
                let peer = self.peer_key(events::AGENT_INFO)?;
                let info = AgentInfoPayload {
                    token: self.identity.session_token.clone(),
                    hostname: self.identity.hostname.clone(),
                };
                let sealed = SealedPayload::seal(&info, peer)?;
                debug!(hostname = %self.identity.hostname, "Sending agent info");
                Ok(Some(Envelope::sealed(events::AGENT_INFO, sealed)))
            }
            InboundEvent::AgentId(sealed) => {
                let payload: AgentIdPayload = sealed.open(&self.identity.keypair)?;
                if let Some(previous) = self.identity.assigned_id {
                    if previous != payload.agent_id {
                        warn!(previous, agent_id = payload.agent_id, "Controller reassigned agent id");
                    }
                }
                self.identity.assigned_id = Some(payload.agent_id);
                self.lifecycle.set_agent_id(Some(payload.agent_id));
                info!(agent_id = payload.agent_id, "Registered with controller");
                Ok(None)
            }
            InboundEvent::ContainerList { message_id } => {
                let peer = self.peer_key(events::CONTAINER_LIST)?.clone();
                match self.runtime.list_containers(false).await {
                    Ok(containers) => {
                        let summaries: Vec<ContainerSummary> =
                            containers.iter().map(ContainerSummary::from).collect();
                        debug!(count = summaries.len(), "Sending container list");
                        let sealed = SealedPayload::seal(&summaries, &peer)?;
                        Ok(Some(
                            Envelope::sealed(events::CONTAINER_LIST, sealed).with_message_id(message_id),
                        ))
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to list containers");
                        Ok(Some(
                            Envelope::error(events::CONTAINER_LIST).with_message_id(message_id),
                        ))
                    }
                }
            }
            InboundEvent::Monitor(sealed) => {
                let directives: Vec<MonitorDirective> = sealed.open(&self.identity.keypair)?;
                self.start_monitoring(directives).await?;
                Ok(None)
            }
            InboundEvent::Pong => {
                debug!("Received pong");
                Ok(None)
            }
            InboundEvent::Unknown(event) => {
                warn!(event = %event, "No handler found for event");
                Ok(None)
            }
        }
    }

    /// Replace the running monitors with a new directive set.
    ///
    /// Running tasks are kept when the containers cannot be listed.
    async fn start_monitoring(&mut self, directives: Vec<MonitorDirective>) -> Result<(), SessionError> {
        if directives.is_empty() {
            info!("Received empty monitor set, nothing to start");
            return Ok(());
        }

        let planned = self
            .engine
            .plan(&directives)
            .await
            .map_err(|e| SessionError::Runtime(format!("{e:#}")))?;

        if self.has_monitors() {
            info!(active = self.monitors.len(), "Replacing active monitors");
            self.monitors.abort_all();
        }

        let started = self.engine.spawn(planned, &mut self.monitors);
        info!(directives = directives.len(), tasks = started, "Monitoring started");
        Ok(())
    }

    /// Turn a log batch into a sealed `log` envelope
    pub fn seal_batch(&self, batch: LogBatch) -> Result<Envelope, SessionError> {
        let peer = self.peer_key(events::LOG)?;
        let payload = LogPayload {
            monitor_id: batch.monitor_id,
            container_name: batch.container_name,
            lines: batch.lines,
        };
        Ok(Envelope::sealed(events::LOG, SealedPayload::seal(&payload, peer)?))
    }

    /// End the session: stop monitor tasks and clear the published id
    pub fn finish(mut self) {
        self.monitors.abort_all();
        self.identity.reset_session();
        self.lifecycle.set_agent_id(None);
    }

    fn peer_key(&self, event: &'static str) -> Result<&PeerKey, SessionError> {
        self.identity
            .peer_key
            .as_ref()
            .ok_or(SessionError::PeerKeyMissing { event })
    }
}
