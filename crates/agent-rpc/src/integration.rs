//! The two sides of the integration contract
//!
//! [`Integration`] is implemented by each data source and called by the agent.
//! [`Agent`] is implemented by the agent and handed to the integration in
//! [`Integration::init`] so it can push records back while it runs.

use crate::{
    Capabilities, ExportConfig, ExportResult, OnboardExportResult, OnboardExportType, Record,
    Result, ValidationResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of one object-type stream opened with [`Agent::export_started`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream handed back by [`Agent::export_started`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle {
    pub stream_id: StreamId,

    /// Watermark of the last successful export of this object type, if any
    #[serde(default)]
    pub last_processed: Option<DateTime<Utc>>,
}

/// Severity of a log line forwarded by an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Callbacks the agent exposes to a running integration
#[async_trait]
pub trait Agent: Send + Sync {
    /// Open a stream for `object_type` and read its checkpoint
    async fn export_started(&self, object_type: &str) -> Result<StreamHandle>;

    /// Deliver a batch of records on an open stream
    async fn send_exported(&self, stream: StreamId, records: Vec<Record>) -> Result<()>;

    /// Finish a stream. `last_processed` advances the checkpoint when set.
    async fn export_done(&self, stream: StreamId, last_processed: Option<DateTime<Utc>>)
        -> Result<()>;

    /// Forward a log line to the agent's logging sink
    async fn log(&self, level: LogLevel, message: String);
}

/// A data source integration
#[async_trait]
pub trait Integration: Send {
    /// Operations this integration serves
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// Receive the agent callbacks. Called once before any other method.
    async fn init(&mut self, agent: Arc<dyn Agent>) -> Result<()>;

    async fn export(&mut self, config: ExportConfig) -> Result<ExportResult>;

    async fn validate_config(&mut self, config: ExportConfig) -> Result<ValidationResult>;

    async fn onboard_export(
        &mut self,
        object_type: OnboardExportType,
        config: ExportConfig,
    ) -> Result<OnboardExportResult>;
}
