//! Error types for the export agent
//!
//! One enum covers every failure the host can report. Integration-side
//! failures arrive as [`agent_rpc::RpcError`] and are mapped into it.

use agent_rpc::RpcError;
use thiserror::Error;

/// Result type alias for export agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Exit code for conditions the supervisor must not restart (EX_CONFIG)
pub const EXIT_CODE_FATAL: i32 = 78;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Bad or missing settings. Never retried.
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    /// The command only accepts a single integration
    #[error("{command} requires exactly one integration, got {count}")]
    MultipleNotAllowed { command: String, count: usize },

    /// Integration binary or registration could not be located
    #[error("Integration not found: {0}")]
    NotFound(String),

    #[error("Failed to launch integration {id}: {message}")]
    LaunchFailed { id: String, message: String },

    #[error("Integration {id} failed to initialize: {message}")]
    InitFailed { id: String, message: String },

    #[error("RPC failure in {id}: {message}")]
    RpcFailure { id: String, message: String },

    /// Panic inside integration code, recovered at the host boundary
    #[error("Integration {id} panicked: {message}")]
    IntegrationPanic { id: String, message: String },

    /// The integration ran and reported an error of its own
    #[error("Integration {id} failed: {message}")]
    IntegrationFailed { id: String, message: String },

    #[error("{operation} on {id} timed out after {secs}s")]
    Timeout {
        id: String,
        operation: String,
        secs: u64,
    },

    #[error("Plugin handle for {0} is closed")]
    HandleClosed(String),

    #[error("Integration {0} is already loaded by another session")]
    AlreadyLoaded(String),

    #[error("Integration {id} does not support {operation}")]
    Unsupported { id: String, operation: String },

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Stored watermark could not be parsed
    #[error("Checkpoint for {id}/{object_type} is corrupt: {value}")]
    CheckpointCorrupt {
        id: String,
        object_type: String,
        value: String,
    },

    #[error("Failed to close integration {id}: {message}")]
    CloseFailed { id: String, message: String },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Session cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Git library error: {0}")]
    Git(#[from] git2::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Error from the integration contract layer without an integration context
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Wrap a contract error raised while talking to integration `id`
    pub fn rpc(id: impl Into<String>, err: RpcError) -> Self {
        let id = id.into();
        match err {
            RpcError::DeliveryFailed(msg) => AgentError::DeliveryFailed(msg),
            RpcError::Config(msg) => AgentError::ConfigInvalid(msg),
            other => AgentError::RpcFailure {
                id,
                message: other.to_string(),
            },
        }
    }

    /// True for conditions a restart cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ConfigInvalid(_)
                | AgentError::Yaml(_)
                | AgentError::CheckpointCorrupt { .. }
        )
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            EXIT_CODE_FATAL
        } else {
            1
        }
    }
}
