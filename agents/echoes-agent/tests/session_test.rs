//! End-to-end session against an in-process controller.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use common::{agent_keypair, controller_keypair, FakeRuntime};
use echoes_agent::agent::session::{AgentIdentity, Session};
use echoes_agent::agent::state::LifecycleManager;
use echoes_agent::connection::protocol::{
    AgentInfoPayload, ContainerSummary, LogPayload, SealedPayload,
};
use echoes_agent::connection::transport::{connect, Endpoint};
use echoes_agent::connection::websocket::{run_session, SessionEnd};
use echoes_agent::crypto::PeerKey;

type Controller = WebSocketStream<TcpStream>;

async fn send(ws: &mut Controller, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next envelope from the agent, skipping keep-alive pings
async fn recv(ws: &mut Controller) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("agent went quiet")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["event"] != "ping" {
                return value;
            }
        }
    }
}

fn open<T: serde::de::DeserializeOwned>(envelope: &Value) -> T {
    let hex = envelope["data"].as_str().unwrap();
    SealedPayload::from_hex(hex).open(controller_keypair()).unwrap()
}

#[tokio::test]
async fn test_registration_and_log_delivery() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let runtime = FakeRuntime::default()
        .with_container("c1", "api-1", &["one", "two", "three"])
        .with_container("c2", "worker", &["ignored"]);
    let lifecycle = LifecycleManager::new();
    let identity = AgentIdentity::new("shared-token", "node-a", Arc::new(agent_keypair().clone()));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let agent_lifecycle = lifecycle.clone();
    let agent = tokio::spawn(async move {
        let endpoint = Endpoint::new(&addr.to_string(), false, true);
        let stream = connect(&endpoint, Duration::from_secs(5)).await.unwrap();

        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let mut session = Session::new(identity, Arc::new(runtime), agent_lifecycle, 2, batch_tx);
        let end = run_session(
            stream,
            &mut session,
            &mut batch_rx,
            &mut shutdown_rx,
            Duration::from_secs(30),
        )
        .await;
        session.finish();
        end
    });

    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    // key exchange
    send(
        &mut ws,
        json!({ "status": "ok", "event": "handshake", "data": { "publicKey": controller_keypair().public_key_pem() } }),
    )
    .await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["event"], "handshake");
    let agent_key = PeerKey::from_pem(reply["data"]["publicKey"].as_str().unwrap()).unwrap();

    // identification
    send(&mut ws, json!({ "status": "ok", "event": "agentInfo" })).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["event"], "agentInfo");
    let info: AgentInfoPayload = open(&reply);
    assert_eq!(info.token, "shared-token");
    assert_eq!(info.hostname, "node-a");

    let sealed = SealedPayload::seal(&json!({ "agentId": 77 }), &agent_key).unwrap();
    send(&mut ws, json!({ "status": "ok", "event": "agentId", "data": sealed.as_hex() })).await;

    // frames are handled in order, so the id is set once this reply arrives
    send(&mut ws, json!({ "event": "containerList", "messageId": "m-1" })).await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["event"], "containerList");
    assert_eq!(reply["messageId"], "m-1");
    let containers: Vec<ContainerSummary> = open(&reply);
    assert_eq!(containers.len(), 2);
    assert_eq!(lifecycle.agent_id(), Some(77));

    // garbage is ignored, unknown events too
    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    send(&mut ws, json!({ "event": "reboot" })).await;

    // monitoring
    let directives = SealedPayload::seal(&json!([{ "id": 3, "pattern": "^api-" }]), &agent_key).unwrap();
    send(&mut ws, json!({ "status": "ok", "event": "monitor", "data": directives.as_hex() })).await;

    let mut lines = Vec::new();
    while lines.len() < 3 {
        let envelope = recv(&mut ws).await;
        assert_eq!(envelope["event"], "log");
        assert_eq!(envelope["status"], "ok");
        let payload: LogPayload = open(&envelope);
        assert_eq!(payload.monitor_id, 3);
        assert_eq!(payload.container_name, "api-1");
        assert!(payload.lines.len() <= 2);
        lines.extend(payload.lines);
    }
    assert_eq!(lines, vec!["one", "two", "three"]);

    // shutdown closes the connection
    shutdown_tx.send(true).unwrap();
    let end = agent.await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::Shutdown);
    assert_eq!(lifecycle.agent_id(), None);

    let mut saw_close = false;
    while let Some(Ok(msg)) = ws.next().await {
        if msg.is_close() {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn test_agent_info_before_handshake_closes_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let identity = AgentIdentity::new("t", "h", Arc::new(agent_keypair().clone()));
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(async move {
        let endpoint = Endpoint::new(&addr.to_string(), false, true);
        let stream = connect(&endpoint, Duration::from_secs(5)).await.unwrap();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let mut session = Session::new(
            identity,
            Arc::new(FakeRuntime::default()),
            LifecycleManager::new(),
            10,
            batch_tx,
        );
        run_session(
            stream,
            &mut session,
            &mut batch_rx,
            &mut shutdown_rx,
            Duration::from_secs(30),
        )
        .await
    });

    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
    send(&mut ws, json!({ "status": "ok", "event": "agentInfo" })).await;

    let err = agent.await.unwrap().unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_controller_close_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let identity = AgentIdentity::new("t", "h", Arc::new(agent_keypair().clone()));
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(async move {
        let endpoint = Endpoint::new(&addr.to_string(), false, true);
        let stream = connect(&endpoint, Duration::from_secs(5)).await.unwrap();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let mut session = Session::new(
            identity,
            Arc::new(FakeRuntime::default()),
            LifecycleManager::new(),
            10,
            batch_tx,
        );
        run_session(
            stream,
            &mut session,
            &mut batch_rx,
            &mut shutdown_rx,
            Duration::from_millis(50),
        )
        .await
    });

    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    // the keep-alive arrives on its own
    let ping = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ping: Value = serde_json::from_str(ping.to_text().unwrap()).unwrap();
    assert_eq!(ping["event"], "ping");

    ws.close(None).await.unwrap();
    assert_eq!(agent.await.unwrap().unwrap(), SessionEnd::Closed);
}

#[tokio::test]
async fn test_zero_keep_alive_period_still_pings() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let identity = AgentIdentity::new("t", "h", Arc::new(agent_keypair().clone()));
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(async move {
        let endpoint = Endpoint::new(&addr.to_string(), false, true);
        let stream = connect(&endpoint, Duration::from_secs(5)).await.unwrap();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);
        let mut session = Session::new(
            identity,
            Arc::new(FakeRuntime::default()),
            LifecycleManager::new(),
            10,
            batch_tx,
        );
        run_session(stream, &mut session, &mut batch_rx, &mut shutdown_rx, Duration::ZERO).await
    });

    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    let ping = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ping: Value = serde_json::from_str(ping.to_text().unwrap()).unwrap();
    assert_eq!(ping["event"], "ping");

    ws.close(None).await.unwrap();
    assert_eq!(agent.await.unwrap().unwrap(), SessionEnd::Closed);
}
