//! Plugin host
//!
//! Integrations are loaded through an [`IntegrationLoader`]. Two transports
//! exist: [`InProcessLoader`] for integrations linked into the agent and
//! [`SubprocessLoader`] for integration binaries speaking the JSON-lines
//! protocol over stdio.

mod host;
pub mod inprocess;
pub mod loader;
pub mod subprocess;

pub use host::{PluginHandle, PluginHost, DEFAULT_CALL_TIMEOUT};
pub use inprocess::{InProcessLoader, IntegrationFactory};
pub use loader::{IntegrationConnection, IntegrationLoader};
pub use subprocess::{RpcConnection, StderrTail, SubprocessLoader, DEFAULT_HANDSHAKE_TIMEOUT};
