//! Export agent - runs data-source integrations and ships incremental exports
//!
//! The agent loads integrations as isolated plugins, hands them callbacks to
//! push records back, and keeps a per-object-type watermark so each run only
//! exports what changed since the last successful one.
//!
//! # Architecture
//!
//! - **plugin**: Plugin host, loaders (in-process, subprocess) and handles
//! - **session**: One command's lifecycle across its integrations
//! - **pipeline**: Host-side agent callbacks and record sinks
//! - **checkpoint**: Watermark stores (SQLite, in-memory)
//! - **supervisor**: Restarting parent process for service mode
//! - **service**: Interval-driven export loop run by the supervised child
//! - **config**: YAML configuration and validation
//!
//! The integration contract itself (traits, wire protocol, object senders,
//! pagination) lives in the `agent-rpc` crate.

// Core modules
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Components
pub mod commands;
pub mod pipeline;
pub mod plugin;
pub mod service;
pub mod session;
pub mod signals;
pub mod supervisor;

// Re-exports
pub use error::{AgentError, Result, EXIT_CODE_FATAL};
pub use plugin::{PluginHandle, PluginHost};
pub use session::{ExportSession, SessionCommand, SessionReport};
