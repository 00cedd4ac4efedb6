//! Error types
//!
//! Typed errors for the crypto, protocol, session and transport layers.

use thiserror::Error;

/// Errors raised by the RSA key handling and payload sealing.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid hex payload: {0}")]
    Encoding(#[from] hex::FromHexError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("key storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Errors raised while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON envelope at all.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    /// The envelope names a known event but its payload has the wrong shape.
    #[error("malformed {event} payload: {reason}")]
    MalformedPayload { event: &'static str, reason: String },
}

/// Errors that end or interrupt a controller session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A confidential event was about to be sent before the handshake.
    #[error("peer public key not received yet, refusing to send {event}")]
    PeerKeyMissing { event: &'static str },

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("failed to encode envelope: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SessionError {
    /// Whether the error must close the connection.
    ///
    /// Everything is fatal except frames that are not envelopes at all and
    /// runtime failures, which are logged and the receive loop continues.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::Protocol(ProtocolError::MalformedFrame(_)) | SessionError::Runtime(_)
        )
    }
}

/// Errors raised while reaching the controller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("controller is not ready: {0}")]
    NotReady(String),

    #[error("connection to {url} timed out")]
    Timeout { url: String },

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}
