//! camstream service
//!
//! Reads start/stop commands as JSON lines, runs the sessions in the worker
//! pool and reports every state change as a JSON line.

pub mod config;
pub mod service;

pub use config::{AppConfig, ConfigError};
pub use service::{handle_line, publish_updates, run_commands, LoopStats};
