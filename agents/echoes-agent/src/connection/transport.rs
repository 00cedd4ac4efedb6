//! Controller Transport
//!
//! Endpoint addressing, the HTTP readiness probe and the websocket dial.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::TransportError;

pub const DEFAULT_HEALTH_PATH: &str = "/general/healthcheck";

/// A websocket to the controller, plain or TLS
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where the controller lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `host:port`, an `http://` style prefix is tolerated
    pub address: String,
    pub tls: bool,
    /// Development deployments serve routes without the `/api` prefix
    pub development: bool,
    pub health_path: String,
}

impl Endpoint {
    pub fn new(address: &str, tls: bool, development: bool) -> Self {
        Self {
            address: address.to_string(),
            tls,
            development,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }

    pub fn with_health_path(mut self, path: &str) -> Self {
        self.health_path = path.to_string();
        self
    }

    fn host(&self) -> &str {
        let address = self.address.trim();
        let address = match address.split_once("://") {
            Some((_, rest)) => rest,
            None => address,
        };
        address.trim_end_matches('/')
    }

    fn prefix(&self) -> &'static str {
        if self.development {
            ""
        } else {
            "/api"
        }
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}{}/ws", self.host(), self.prefix())
    }

    pub fn health_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let path = self.health_path.trim();
        let slash = if path.starts_with('/') { "" } else { "/" };
        format!("{scheme}://{}{}{slash}{path}", self.host(), self.prefix())
    }
}

/// `GET` the controller health endpoint; only HTTP 200 counts as ready
pub async fn probe_health(client: &reqwest::Client, url: &str) -> Result<(), TransportError> {
    debug!(url = %url, "Probing controller health");

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| TransportError::NotReady(format!("{url}: {e}")))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(TransportError::NotReady(format!("{url} answered {status}")));
    }

    info!(url = %url, "Controller is ready");
    Ok(())
}

/// Open the websocket under a connect timeout
pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<WsStream, TransportError> {
    let url = endpoint.ws_url();
    info!(url = %url, "Connecting to controller");

    let (stream, _response) = timeout(connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| TransportError::Timeout { url: url.clone() })?
        .map_err(|source| TransportError::Connect {
            url: url.clone(),
            source,
        })?;

    info!(url = %url, "WebSocket connection established");
    Ok(stream)
}
