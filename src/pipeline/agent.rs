//! Host-side implementation of the agent callbacks
//!
//! One [`ExportAgent`] serves one integration for one session. It hands out
//! stream ids, reads watermarks when a stream opens, forwards batches to the
//! record sink and commits the watermark once the stream is finalized.

use super::sink::RecordSink;
use crate::checkpoint::CheckpointStore;
use crate::{metrics, AgentError};
use agent_rpc::{Agent, IntegrationId, LogLevel, Record, RpcError, StreamHandle, StreamId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
struct StreamState {
    object_type: String,
    delivered: u64,
    done: bool,
}

/// Per-stream delivery totals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub object_type: String,
    pub delivered: u64,
    pub done: bool,
}

pub struct ExportAgent {
    id: IntegrationId,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    reprocess_historical: bool,
    next_stream: AtomicU64,
    streams: Mutex<HashMap<StreamId, StreamState>>,
}

impl ExportAgent {
    pub fn new(
        id: IntegrationId,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            id,
            checkpoints,
            sink,
            reprocess_historical: false,
            next_stream: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Ignore stored watermarks and let the next commit overwrite them
    pub fn with_reprocess_historical(mut self, reprocess: bool) -> Self {
        self.reprocess_historical = reprocess;
        self
    }

    pub fn integration_id(&self) -> &IntegrationId {
        &self.id
    }

    /// Streams opened so far, in stream id order
    pub fn summary(&self) -> Vec<StreamSummary> {
        let streams = self.lock();
        let mut ids: Vec<_> = streams.keys().copied().collect();
        ids.sort_by_key(|s| s.0);
        ids.into_iter()
            .filter_map(|id| streams.get(&id))
            .map(|s| StreamSummary {
                object_type: s.object_type.clone(),
                delivered: s.delivered,
                done: s.done,
            })
            .collect()
    }

    /// Records delivered per object type
    pub fn delivered(&self) -> HashMap<String, u64> {
        let mut totals = HashMap::new();
        for s in self.lock().values() {
            *totals.entry(s.object_type.clone()).or_insert(0) += s.delivered;
        }
        totals
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, StreamState>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Object type of an open stream
    fn open_stream(&self, stream: StreamId) -> Result<String, RpcError> {
        match self.lock().get(&stream) {
            None => Err(RpcError::integration(format!("unknown stream {}", stream))),
            Some(state) if state.done => Err(RpcError::SenderClosed(state.object_type.clone())),
            Some(state) => Ok(state.object_type.clone()),
        }
    }

    fn commit_checkpoint(&self, object_type: &str, at: DateTime<Utc>) -> crate::Result<()> {
        if !self.reprocess_historical {
            if let Some(current) = self.checkpoints.get(&self.id, object_type)? {
                if at <= current {
                    warn!(
                        integration = %self.id,
                        object_type,
                        current = %current,
                        proposed = %at,
                        "Ignoring checkpoint that does not move forward"
                    );
                    return Ok(());
                }
            }
        }

        self.checkpoints.set(&self.id, object_type, at)?;
        metrics::record_checkpoint_commit(&self.id.to_string(), object_type);
        info!(integration = %self.id, object_type, last_processed = %at, "Checkpoint committed");
        Ok(())
    }
}

fn to_rpc(err: AgentError) -> RpcError {
    match err {
        AgentError::DeliveryFailed(msg) => RpcError::DeliveryFailed(msg),
        other => RpcError::Integration(other.to_string()),
    }
}

#[async_trait]
impl Agent for ExportAgent {
    async fn export_started(&self, object_type: &str) -> agent_rpc::Result<StreamHandle> {
        let last_processed = if self.reprocess_historical {
            // Reset before the crawl so an aborted run cannot resume incrementally
            self.checkpoints
                .clear(&self.id, object_type)
                .map_err(to_rpc)?;
            info!(integration = %self.id, object_type, "Watermark reset, reprocessing historical data");
            None
        } else {
            self.checkpoints
                .get(&self.id, object_type)
                .map_err(to_rpc)?
        };

        let stream_id = StreamId(self.next_stream.fetch_add(1, Ordering::SeqCst));
        self.lock().insert(
            stream_id,
            StreamState {
                object_type: object_type.to_string(),
                delivered: 0,
                done: false,
            },
        );

        debug!(
            integration = %self.id,
            object_type,
            stream = %stream_id,
            last_processed = ?last_processed,
            "Export started"
        );
        Ok(StreamHandle {
            stream_id,
            last_processed,
        })
    }

    async fn send_exported(&self, stream: StreamId, records: Vec<Record>) -> agent_rpc::Result<()> {
        let object_type = self.open_stream(stream)?;
        if records.is_empty() {
            return Ok(());
        }

        self.sink
            .write(&self.id, &object_type, &records)
            .map_err(|e| RpcError::DeliveryFailed(e.to_string()))?;

        if let Some(state) = self.lock().get_mut(&stream) {
            state.delivered += records.len() as u64;
        }
        metrics::record_delivered(&self.id.to_string(), &object_type, records.len());
        trace!(integration = %self.id, object_type, count = records.len(), "Batch delivered");
        Ok(())
    }

    async fn export_done(
        &self,
        stream: StreamId,
        last_processed: Option<DateTime<Utc>>,
    ) -> agent_rpc::Result<()> {
        let object_type = self.open_stream(stream)?;
        if let Some(state) = self.lock().get_mut(&stream) {
            state.done = true;
        }

        self.sink
            .finish(&self.id, &object_type, last_processed)
            .map_err(|e| RpcError::DeliveryFailed(e.to_string()))?;

        if let Some(at) = last_processed {
            self.commit_checkpoint(&object_type, at).map_err(to_rpc)?;
        }

        debug!(integration = %self.id, object_type, "Export done");
        Ok(())
    }

    async fn log(&self, level: LogLevel, message: String) {
        let integration = self.id.to_string();
        match level {
            LogLevel::Trace => trace!(integration, "{}", message),
            LogLevel::Debug => debug!(integration, "{}", message),
            LogLevel::Info => info!(integration, "{}", message),
            LogLevel::Warn => warn!(integration, "{}", message),
            LogLevel::Error => error!(integration, "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::pipeline::MemorySink;
    use agent_rpc::{FullSyncSender, IncrementalSender, IntegrationType};
    use chrono::Duration;

    struct Fixture {
        checkpoints: Arc<MemoryCheckpointStore>,
        sink: Arc<MemorySink>,
        id: IntegrationId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
                sink: Arc::new(MemorySink::new()),
                id: IntegrationId::new("jira", IntegrationType::Work),
            }
        }

        fn agent(&self, reprocess: bool) -> Arc<ExportAgent> {
            Arc::new(
                ExportAgent::new(self.id.clone(), self.checkpoints.clone(), self.sink.clone())
                    .with_reprocess_historical(reprocess),
            )
        }
    }

    fn record(id: &str) -> Record {
        let mut r = Record::new();
        r.insert("ref_id".to_string(), serde_json::json!(id));
        r
    }

    #[tokio::test]
    async fn test_incremental_commit_equals_crawl_start() {
        let fx = Fixture::new();
        let agent = fx.agent(false);

        let sender = IncrementalSender::new(agent.clone(), "work.issue").await.unwrap();
        let started = sender.crawl_started();
        sender.send(vec![record("1"), record("2")]).await.unwrap();
        sender.done().await.unwrap();

        assert_eq!(fx.checkpoints.get(&fx.id, "work.issue").unwrap(), Some(started));
        assert_eq!(fx.sink.records("work.issue").len(), 2);
        assert_eq!(agent.delivered().get("work.issue"), Some(&2));
    }

    #[tokio::test]
    async fn test_crashed_run_keeps_watermark() {
        let fx = Fixture::new();
        let before = Utc::now() - Duration::days(3);
        fx.checkpoints.set(&fx.id, "work.issue", before).unwrap();

        {
            let agent = fx.agent(false);
            let sender = IncrementalSender::new(agent, "work.issue").await.unwrap();
            assert_eq!(sender.last_processed(), Some(before));
            sender.send(vec![record("1")]).await.unwrap();
            // dropped without done
        }

        let agent = fx.agent(false);
        let sender = IncrementalSender::new(agent, "work.issue").await.unwrap();
        assert_eq!(sender.last_processed(), Some(before));
    }

    #[tokio::test]
    async fn test_reprocess_historical_hides_and_overwrites_watermark() {
        let fx = Fixture::new();
        let future = Utc::now() + Duration::days(1);
        fx.checkpoints.set(&fx.id, "work.issue", future).unwrap();

        let agent = fx.agent(true);
        let sender = IncrementalSender::new(agent, "work.issue").await.unwrap();
        assert_eq!(sender.last_processed(), None);
        let started = sender.crawl_started();
        sender.done().await.unwrap();

        assert_eq!(fx.checkpoints.get(&fx.id, "work.issue").unwrap(), Some(started));
    }

    #[tokio::test]
    async fn test_aborted_reprocess_leaves_no_watermark() {
        let fx = Fixture::new();
        let old = Utc::now() - Duration::days(2);
        fx.checkpoints.set(&fx.id, "work.issue", old).unwrap();

        {
            let agent = fx.agent(true);
            let sender = IncrementalSender::new(agent, "work.issue").await.unwrap();
            assert_eq!(sender.last_processed(), None);
            sender.send(vec![record("1")]).await.unwrap();
            // dropped without done
        }

        assert!(fx.checkpoints.get(&fx.id, "work.issue").unwrap().is_none());

        // The next plain run starts from the beginning
        let agent = fx.agent(false);
        let sender = IncrementalSender::new(agent, "work.issue").await.unwrap();
        assert_eq!(sender.last_processed(), None);
    }

    #[tokio::test]
    async fn test_backwards_checkpoint_is_ignored() {
        let fx = Fixture::new();
        let agent = fx.agent(false);
        let now = Utc::now();
        fx.checkpoints.set(&fx.id, "work.issue", now).unwrap();

        let handle = agent.export_started("work.issue").await.unwrap();
        agent
            .export_done(handle.stream_id, Some(now - Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(fx.checkpoints.get(&fx.id, "work.issue").unwrap(), Some(now));
    }

    #[tokio::test]
    async fn test_full_sync_never_commits() {
        let fx = Fixture::new();
        let agent = fx.agent(false);
        let sender = FullSyncSender::new(agent, "work.priority").await.unwrap();
        sender.send_one(record("p1")).await.unwrap();
        sender.done().await.unwrap();

        assert!(fx.checkpoints.is_empty());
        assert_eq!(fx.sink.finished().len(), 1);
        assert_eq!(fx.sink.finished()[0].2, None);
    }

    #[tokio::test]
    async fn test_unknown_and_finished_streams() {
        let fx = Fixture::new();
        let agent = fx.agent(false);

        let err = agent
            .send_exported(StreamId(99), vec![record("1")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown stream"));

        let handle = agent.export_started("work.user").await.unwrap();
        agent.export_done(handle.stream_id, None).await.unwrap();
        let err = agent
            .send_exported(handle.stream_id, vec![record("1")])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::SenderClosed(_)));
        assert!(agent.export_done(handle.stream_id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_sink_failure_blocks_checkpoint() {
        let fx = Fixture::new();
        let agent = fx.agent(false);
        fx.sink.fail_writes(true);

        let sender = IncrementalSender::new(agent, "work.issue").await.unwrap();
        sender.send(vec![record("1")]).await.unwrap();
        let err = sender.done().await.unwrap_err();
        assert!(matches!(err, RpcError::DeliveryFailed(_)));
        assert!(fx.checkpoints.get(&fx.id, "work.issue").unwrap().is_none());
    }
}
