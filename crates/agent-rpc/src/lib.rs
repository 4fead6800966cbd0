//! Integration contract for export-agent
//!
//! Everything an integration binary and the agent host must agree on lives here:
//! identifiers, the per-invocation [`ExportConfig`], the [`Integration`] and
//! [`Agent`] traits, the JSON-lines wire protocol, and the helpers integrations
//! use while crawling (object senders, pagination drivers, accumulators).
//!
//! # Example
//!
//! ```no_run
//! use agent_rpc::{serve_stdio, Integration};
//!
//! # async fn run(integration: impl Integration + 'static) -> agent_rpc::Result<()> {
//! // inside an integration binary's main
//! serve_stdio(integration).await?;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod ids;
pub mod integration;
pub mod objsender;
pub mod paginate;
pub mod serve;
pub mod types;
pub mod wire;

pub use accumulator::Accumulator;
pub use ids::{IntegrationId, IntegrationType};
pub use integration::{Agent, Integration, LogLevel, StreamHandle, StreamId};
pub use objsender::{FullSyncSender, IncrementalSender, DEFAULT_BATCH_SIZE};
pub use paginate::{paginate_cursor, paginate_offset, PageInfo, PageOutcome, PageRequest};
pub use serve::{dispatch, panic_message, serve, serve_stdio};
pub use types::{
    Capabilities, Capability, ExportConfig, ExportResult, IntegrationConfig, OnboardExportResult,
    OnboardExportType, Record, ValidationResult, ONBOARD_NOT_SUPPORTED,
};

use thiserror::Error;

/// Errors shared by integrations and the host across the contract boundary
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("invalid integration id type: {0}")]
    InvalidIntegrationType(String),

    #[error("invalid integration id: {0}")]
    InvalidIntegrationId(String),

    #[error("object-type must be one of: users, repos, projects, workconfig, got {0}")]
    InvalidOnboardType(String),

    #[error("config validation error: {0}")]
    Config(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("sender for {0} is already done")]
    SenderClosed(String),

    #[error("pagination error: {0}")]
    Pagination(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Integration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Build a free-form integration error
    pub fn integration(msg: impl Into<String>) -> Self {
        Self::Integration(msg.into())
    }
}

/// Result type for contract operations
pub type Result<T> = std::result::Result<T, RpcError>;
