//! WebSocket Client
//!
//! Drives the controller connection: probe once, then connect, run the
//! session and back off until shutdown or until the retry budget runs out.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::agent::monitor::{LogBatch, DEFAULT_BATCH_SIZE};
use crate::agent::session::{AgentIdentity, Session};
use crate::agent::state::LifecycleManager;
use crate::connection::protocol::Envelope;
use crate::connection::transport::{connect, probe_health, Endpoint};
use crate::error::{SessionError, TransportError};
use crate::runtime::adapter::RuntimeAdapter;

/// Shortest keep-alive period; a zero period cannot drive an interval
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Timing and sizing knobs for the client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Wall-clock time since start after which reconnecting stops
    pub retry_budget: Duration,
    pub backoff: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub batch_size: usize,
    /// Batches buffered between monitor tasks and the writer
    pub batch_queue: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry_budget: Duration::from_secs(60),
            backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_queue: 64,
        }
    }
}

/// Why the client stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    RetryBudgetExhausted,
}

/// How one session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Controller closed the connection or the stream ended
    Closed,
    Shutdown,
}

/// WebSocket client for controller communication
pub struct WebSocketClient<R: RuntimeAdapter + 'static> {
    endpoint: Endpoint,
    options: ClientOptions,
    identity: AgentIdentity,
    runtime: Arc<R>,
    lifecycle: LifecycleManager,
    http: reqwest::Client,
    started: Instant,
}

impl<R: RuntimeAdapter + 'static> WebSocketClient<R> {
    /// Create a new client; the retry budget counts from here
    pub fn new(
        endpoint: Endpoint,
        identity: AgentIdentity,
        runtime: Arc<R>,
        lifecycle: LifecycleManager,
    ) -> Self {
        Self {
            endpoint,
            options: ClientOptions::default(),
            identity,
            runtime,
            lifecycle,
            http: reqwest::Client::new(),
            started: Instant::now(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Run until shutdown or until the retry budget is spent
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<ExitReason, TransportError> {
        let health_url = self.endpoint.health_url();
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return Ok(self.stop()),
            probe = probe_health(&self.http, &health_url) => {
                if let Err(e) = probe {
                    error!(error = %e, "Controller health probe failed");
                    self.lifecycle.set_terminated("Controller not ready");
                    return Err(e);
                }
            }
        }

        loop {
            self.lifecycle.set_connecting();

            let connected = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return Ok(self.stop()),
                connected = connect(&self.endpoint, self.options.connect_timeout) => connected,
            };

            let reason = match connected {
                Ok(stream) => {
                    self.lifecycle.set_running();
                    match self.run_connection(stream, &mut shutdown).await {
                        Ok(SessionEnd::Shutdown) => return Ok(self.stop()),
                        Ok(SessionEnd::Closed) => {
                            info!("Controller connection closed");
                            "Connection closed".to_string()
                        }
                        Err(e) => {
                            error!(error = %e, "Session ended with error");
                            format!("Session error: {e}")
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Connection attempt failed");
                    format!("Connect failed: {e}")
                }
            };

            if self.started.elapsed() >= self.options.retry_budget {
                warn!(
                    budget_secs = self.options.retry_budget.as_secs(),
                    "Retry budget exhausted, giving up"
                );
                self.lifecycle.set_terminated("Retry budget exhausted");
                return Ok(ExitReason::RetryBudgetExhausted);
            }

            self.lifecycle.set_backoff(Some(reason));
            info!(
                interval_ms = self.options.backoff.as_millis() as u64,
                "Waiting before reconnection attempt"
            );
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return Ok(self.stop()),
                _ = tokio::time::sleep(self.options.backoff) => {}
            }
        }
    }

    async fn run_connection<S>(
        &self,
        stream: S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, SessionError>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let (batch_tx, mut batch_rx) = mpsc::channel(self.options.batch_queue);
        let mut session = Session::new(
            self.identity.for_new_session(),
            self.runtime.clone(),
            self.lifecycle.clone(),
            self.options.batch_size,
            batch_tx,
        );

        let result = run_session(
            stream,
            &mut session,
            &mut batch_rx,
            shutdown,
            self.options.ping_interval,
        )
        .await;

        session.finish();
        result
    }

    fn stop(&self) -> ExitReason {
        info!("Shutdown requested, stopping client");
        self.lifecycle.set_terminated("Shutdown requested");
        ExitReason::Shutdown
    }
}

/// Builder for WebSocketClient
pub struct WebSocketClientBuilder<R: RuntimeAdapter + 'static> {
    endpoint: Endpoint,
    identity: AgentIdentity,
    runtime: Arc<R>,
    lifecycle: Option<LifecycleManager>,
    options: ClientOptions,
}

impl<R: RuntimeAdapter + 'static> WebSocketClientBuilder<R> {
    pub fn new(endpoint: Endpoint, identity: AgentIdentity, runtime: Arc<R>) -> Self {
        Self {
            endpoint,
            identity,
            runtime,
            lifecycle: None,
            options: ClientOptions::default(),
        }
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleManager) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn retry_budget(mut self, budget: Duration) -> Self {
        self.options.retry_budget = budget;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.options.backoff = backoff;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval.max(MIN_PING_INTERVAL);
        self
    }

    pub fn batch_size(mut self, lines: usize) -> Self {
        self.options.batch_size = lines;
        self
    }

    pub fn batch_queue(mut self, capacity: usize) -> Self {
        self.options.batch_queue = capacity;
        self
    }

    pub fn build(self) -> WebSocketClient<R> {
        WebSocketClient::new(
            self.endpoint,
            self.identity,
            self.runtime,
            self.lifecycle.unwrap_or_default(),
        )
        .with_options(self.options)
    }
}

/// Resolves once the shutdown flag is set. A dropped sender counts as shutdown.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run one session over an open websocket.
///
/// This loop is the only writer on the connection: replies, log batches and
/// keep-alive pings all go out from here, one frame at a time.
pub async fn run_session<S, R>(
    stream: S,
    session: &mut Session<R>,
    batch_rx: &mut mpsc::Receiver<LogBatch>,
    shutdown: &mut watch::Receiver<bool>,
    ping_interval: Duration,
) -> Result<SessionEnd, SessionError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    R: RuntimeAdapter + 'static,
{
    let (mut write, mut read) = stream.split();

    let ping_interval = ping_interval.max(MIN_PING_INTERVAL);
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match session.handle_frame(&text).await {
                            Ok(Some(reply)) => send(&mut write, &reply).await?,
                            Ok(None) => {}
                            Err(e) if e.is_fatal() => {
                                error!(error = %e, "Fatal session error, closing connection");
                                close(&mut write).await;
                                return Err(e);
                            }
                            Err(e) => warn!(error = %e, "Failed to handle message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Received ping, sending pong");
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Received binary message (ignored)");
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        return Err(e.into());
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return Ok(SessionEnd::Closed);
                    }
                }
            }

            Some(batch) = batch_rx.recv() => {
                debug!(
                    monitor_id = batch.monitor_id,
                    container = %batch.container_name,
                    lines = batch.lines.len(),
                    "Sending log batch"
                );
                let envelope = match session.seal_batch(batch) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        error!(error = %e, "Failed to seal log batch, closing connection");
                        close(&mut write).await;
                        return Err(e);
                    }
                };
                send(&mut write, &envelope).await?;
            }

            Some(()) = session.join_monitor(), if session.has_monitors() => {}

            _ = ping.tick() => {
                debug!("Sending keep-alive ping");
                send(&mut write, &Envelope::ping()).await?;
            }

            _ = wait_for_shutdown(shutdown) => {
                info!("Shutdown requested, closing controller connection");
                close(&mut write).await;
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

async fn send<W>(write: &mut W, envelope: &Envelope) -> Result<(), SessionError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let json = envelope.to_json()?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn close<W>(write: &mut W)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    if let Err(e) = write.send(Message::Close(None)).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent_keypair, MockRuntime};

    fn identity() -> AgentIdentity {
        AgentIdentity::new("token", "host", Arc::new(agent_keypair().clone()))
    }

    fn closed_port() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_builder_options() {
        let client = WebSocketClientBuilder::new(
            Endpoint::new("localhost:1", false, false),
            identity(),
            Arc::new(MockRuntime::default()),
        )
        .retry_budget(Duration::from_secs(5))
        .backoff(Duration::from_millis(10))
        .batch_size(10)
        .build();

        assert_eq!(client.options.retry_budget, Duration::from_secs(5));
        assert_eq!(client.options.backoff, Duration::from_millis(10));
        assert_eq!(client.options.batch_size, 10);
        assert_eq!(client.options.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_ping_interval_is_raised() {
        let client = WebSocketClientBuilder::new(
            Endpoint::new("localhost:1", false, false),
            identity(),
            Arc::new(MockRuntime::default()),
        )
        .ping_interval(Duration::ZERO)
        .build();

        assert_eq!(client.options.ping_interval, MIN_PING_INTERVAL);
    }

    #[tokio::test]
    async fn test_probe_failure_aborts_before_connecting() {
        let lifecycle = LifecycleManager::new();
        let mut client = WebSocketClientBuilder::new(
            Endpoint::new(&closed_port(), false, false),
            identity(),
            Arc::new(MockRuntime::default()),
        )
        .lifecycle(lifecycle.clone())
        .build();

        let (_tx, rx) = watch::channel(false);
        let err = client.run(rx).await.unwrap_err();
        assert!(matches!(err, TransportError::NotReady(_)));
        assert_eq!(lifecycle.connection_attempts(), 0);
        assert_eq!(
            lifecycle.current_state(),
            crate::agent::state::LifecycleState::Terminated
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_probe_completes() {
        let mut client = WebSocketClientBuilder::new(
            Endpoint::new(&closed_port(), false, false),
            identity(),
            Arc::new(MockRuntime::default()),
        )
        .build();

        let (_tx, rx) = watch::channel(true);
        assert_eq!(client.run(rx).await.unwrap(), ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_for_shutdown(&mut rx).await;
    }
}
