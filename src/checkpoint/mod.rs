//! Checkpoint store
//!
//! Durable per-integration, per-object-type watermarks. The store only keeps
//! values; the host-side agent decides when a watermark may move.

mod memory;
mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use sqlite::{SqliteCheckpointStore, CHECKPOINT_DB_NAME};

use crate::{AgentError, Result};
use agent_rpc::IntegrationId;
use chrono::{DateTime, SecondsFormat, Utc};

/// Watermark storage keyed by (integration, object type)
pub trait CheckpointStore: Send + Sync {
    /// Last processed instant, `None` for object types never exported
    fn get(&self, id: &IntegrationId, object_type: &str) -> Result<Option<DateTime<Utc>>>;

    fn set(&self, id: &IntegrationId, object_type: &str, at: DateTime<Utc>) -> Result<()>;

    /// Forget the watermark so the next crawl starts from the beginning
    fn clear(&self, id: &IntegrationId, object_type: &str) -> Result<()>;
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored watermark. Anything unreadable is corrupt, never guessed.
pub(crate) fn parse_timestamp(
    id: &IntegrationId,
    object_type: &str,
    value: &str,
) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AgentError::CheckpointCorrupt {
            id: id.to_string(),
            object_type: object_type.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_keeps_precision() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let id = IntegrationId::untyped("github");
        let text = format_timestamp(at);
        assert_eq!(text, "2023-11-14T22:13:20.123456789Z");
        assert_eq!(parse_timestamp(&id, "repo", &text).unwrap(), at);
    }

    #[test]
    fn test_corrupt_value() {
        let id = IntegrationId::untyped("github");
        let err = parse_timestamp(&id, "repo", "yesterday").unwrap_err();
        assert!(matches!(err, AgentError::CheckpointCorrupt { .. }));
    }
}
