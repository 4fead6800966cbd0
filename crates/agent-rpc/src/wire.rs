//! JSON-lines wire protocol between the agent host and an integration process
//!
//! Each message is one JSON object on its own line. The integration writes to
//! its stdout and reads from its stdin.
//!
//! ```text
//! plugin -> host   {"type":"hello","protocol_version":1,"capabilities":["export"]}
//! host -> plugin   {"type":"call","id":1,"call":{"method":"init"}}
//! plugin -> host   {"type":"reply","id":1,"outcome":{"status":"ok","value":{"kind":"init"}}}
//! plugin -> host   {"type":"callback","id":1,"callback":{"method":"export_started","params":{"object_type":"work.issue"}}}
//! host -> plugin   {"type":"callback_reply","id":1,"outcome":{"status":"stream","value":{"stream_id":0}}}
//! ```

use crate::{
    Capabilities, Capability, ExportConfig, ExportResult, LogLevel, OnboardExportResult,
    OnboardExportType, Record, Result, RpcError, StreamHandle, StreamId, ValidationResult,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Bumped on incompatible protocol changes
pub const PROTOCOL_VERSION: u32 = 1;

/// A call from the host into the integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Call {
    Init,
    Export(ExportConfig),
    ValidateConfig(ExportConfig),
    OnboardExport {
        object_type: OnboardExportType,
        config: ExportConfig,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Export(_) => "export",
            Self::ValidateConfig(_) => "validate_config",
            Self::OnboardExport { .. } => "onboard_export",
        }
    }

    /// Capability the integration must declare to receive this call
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            Self::Init => None,
            Self::Export(_) => Some(Capability::Export),
            Self::ValidateConfig(_) => Some(Capability::ValidateConfig),
            Self::OnboardExport { .. } => Some(Capability::OnboardExport),
        }
    }
}

/// Successful result of a [`Call`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum CallValue {
    Init,
    Export(ExportResult),
    ValidateConfig(ValidationResult),
    OnboardExport(OnboardExportResult),
}

/// How a call ended inside the integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallOutcome {
    Ok(CallValue),
    Error(String),
    /// The integration panicked; the message is the panic payload
    Panic(String),
}

/// An [`Agent`](crate::Agent) callback made by the integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Callback {
    ExportStarted {
        object_type: String,
    },
    SendExported {
        stream: StreamId,
        records: Vec<Record>,
    },
    ExportDone {
        stream: StreamId,
        #[serde(default)]
        last_processed: Option<DateTime<Utc>>,
    },
}

/// Host answer to a [`Callback`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Stream(StreamHandle),
    Ack,
    Error(String),
}

/// Messages written by the integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginMessage {
    Hello {
        protocol_version: u32,
        capabilities: Capabilities,
    },
    Reply {
        id: u64,
        outcome: CallOutcome,
    },
    Callback {
        id: u64,
        callback: Callback,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Messages written by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Call { id: u64, call: Call },
    CallbackReply { id: u64, outcome: CallbackOutcome },
    Shutdown,
}

/// Write one message as a JSON line and flush
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message, skipping blank lines. `None` on EOF.
pub async fn read_message<R, T>(reader: &mut R, line: &mut String) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    loop {
        line.clear();
        if reader.read_line(line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| RpcError::Protocol(format!("invalid message: {}", e)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IntegrationConfig, IntegrationId};
    use tokio::io::BufReader;

    #[test]
    fn test_call_shape() {
        let msg = HostMessage::Call {
            id: 3,
            call: Call::Init,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"call","id":3,"call":{"method":"init"}}"#);
    }

    #[test]
    fn test_panic_outcome_shape() {
        let msg = PluginMessage::Reply {
            id: 9,
            outcome: CallOutcome::Panic("index out of bounds".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"reply","id":9,"outcome":{"status":"panic","value":"index out of bounds"}}"#
        );
    }

    #[test]
    fn test_required_capability() {
        let config = ExportConfig {
            integration: IntegrationConfig::new(IntegrationId::untyped("github")),
            ..Default::default()
        };
        assert_eq!(Call::Init.required_capability(), None);
        assert_eq!(
            Call::ValidateConfig(config).required_capability(),
            Some(Capability::ValidateConfig)
        );
    }

    #[tokio::test]
    async fn test_read_skips_blank_lines() {
        let input = b"\n\n{\"type\":\"shutdown\"}\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut line = String::new();

        let msg: Option<HostMessage> = read_message(&mut reader, &mut line).await.unwrap();
        assert_eq!(msg, Some(HostMessage::Shutdown));

        let eof: Option<HostMessage> = read_message(&mut reader, &mut line).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_read_rejects_garbage() {
        let input = b"not json\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut line = String::new();
        let result: Result<Option<HostMessage>> = read_message(&mut reader, &mut line).await;
        assert!(matches!(result, Err(RpcError::Protocol(_))));
    }
}
