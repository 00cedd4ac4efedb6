//! Agent module
//!
//! This module contains the core agent functionality: the controller session,
//! the log monitor engine, lifecycle state and the health endpoint.

pub mod health;
pub mod monitor;
pub mod session;
pub mod state;
