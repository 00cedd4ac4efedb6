//! Connection module
//!
//! This module handles all communication with the controller, including the
//! transport, the WebSocket session loop and the message protocol.

pub mod protocol;
pub mod transport;
pub mod websocket;
