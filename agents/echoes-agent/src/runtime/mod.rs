//! Runtime module
//!
//! This module provides abstraction over the container runtime through a
//! common RuntimeAdapter trait, plus line framing for log output.

pub mod adapter;
pub mod docker;
pub mod lines;
