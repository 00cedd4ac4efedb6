//! CLI support
pub mod config;
