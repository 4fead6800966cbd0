//! Object senders
//!
//! Buffer records produced during a crawl and ship them to the agent in
//! batches, one stream per object type.
//!
//! - [`IncrementalSender`] reads the last-processed watermark when it is created
//!   and, if the crawl finishes cleanly, advances it to the instant the crawl
//!   started. A crawl that fails or never reaches `done` leaves the watermark
//!   untouched, so the next run starts again from the old one.
//! - [`FullSyncSender`] resends everything on every run and never touches
//!   checkpoints.

use crate::{Agent, Record, Result, RpcError, StreamId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Records buffered before a batch is shipped
pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Default)]
struct SenderState {
    buffer: Vec<Record>,
    sent: u64,
    failed: Option<String>,
    done: bool,
}

struct SenderCore {
    agent: Arc<dyn Agent>,
    object_type: String,
    stream: StreamId,
    batch_size: usize,
    state: Mutex<SenderState>,
}

impl SenderCore {
    async fn open(
        agent: Arc<dyn Agent>,
        object_type: &str,
    ) -> Result<(Self, Option<DateTime<Utc>>)> {
        let handle = agent.export_started(object_type).await?;
        debug!(
            object_type,
            stream = %handle.stream_id,
            last_processed = ?handle.last_processed,
            "Export stream opened"
        );

        let core = Self {
            agent,
            object_type: object_type.to_string(),
            stream: handle.stream_id,
            batch_size: DEFAULT_BATCH_SIZE,
            state: Mutex::new(SenderState::default()),
        };
        Ok((core, handle.last_processed))
    }

    async fn send(&self, records: Vec<Record>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.done {
            return Err(RpcError::SenderClosed(self.object_type.clone()));
        }
        if let Some(ref err) = state.failed {
            return Err(RpcError::DeliveryFailed(format!(
                "{}: earlier batch failed: {}",
                self.object_type, err
            )));
        }

        state.buffer.extend(records);
        if state.buffer.len() >= self.batch_size {
            self.flush(&mut state).await?;
        }
        Ok(())
    }

    async fn flush(&self, state: &mut SenderState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut state.buffer);
        let count = batch.len() as u64;
        match self.agent.send_exported(self.stream, batch).await {
            Ok(()) => {
                state.sent += count;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                state.failed = Some(message.clone());
                Err(RpcError::DeliveryFailed(format!("{}: {}", self.object_type, message)))
            }
        }
    }

    async fn finish(&self, watermark: Option<DateTime<Utc>>) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.done {
            return Err(RpcError::SenderClosed(self.object_type.clone()));
        }
        state.done = true;

        let flushed = if state.failed.is_none() {
            self.flush(&mut state).await
        } else {
            Ok(())
        };

        let commit = match state.failed {
            None => watermark,
            Some(ref err) => {
                warn!(
                    object_type = %self.object_type,
                    error = %err,
                    "Export stream finished after a failed batch, checkpoint not advanced"
                );
                None
            }
        };

        self.agent.export_done(self.stream, commit).await?;
        flushed?;

        if let Some(ref err) = state.failed {
            return Err(RpcError::DeliveryFailed(format!("{}: {}", self.object_type, err)));
        }

        debug!(object_type = %self.object_type, sent = state.sent, "Export stream done");
        Ok(state.sent)
    }

    async fn sent(&self) -> u64 {
        self.state.lock().await.sent
    }
}

impl Drop for SenderCore {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if !state.done {
                warn!(
                    object_type = %self.object_type,
                    stream = %self.stream,
                    "Sender dropped before done, checkpoint not advanced"
                );
            }
        }
    }
}

/// Date-based incremental sender
pub struct IncrementalSender {
    core: SenderCore,
    crawl_started: DateTime<Utc>,
    last_processed: Option<DateTime<Utc>>,
}

impl IncrementalSender {
    /// Open an incremental stream, capturing now as the crawl start
    pub async fn new(agent: Arc<dyn Agent>, object_type: &str) -> Result<Self> {
        Self::starting_at(agent, object_type, Utc::now()).await
    }

    /// Open an incremental stream with an explicit crawl start
    pub async fn starting_at(
        agent: Arc<dyn Agent>,
        object_type: &str,
        crawl_started: DateTime<Utc>,
    ) -> Result<Self> {
        let (core, last_processed) = SenderCore::open(agent, object_type).await?;
        Ok(Self {
            core,
            crawl_started,
            last_processed,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.core.batch_size = batch_size.max(1);
        self
    }

    /// Watermark from the previous successful run
    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        self.last_processed
    }

    pub fn crawl_started(&self) -> DateTime<Utc> {
        self.crawl_started
    }

    /// True once a crawl ordered by update time reaches already exported data
    pub fn reached_watermark(&self, updated_at: DateTime<Utc>) -> bool {
        matches!(self.last_processed, Some(lp) if updated_at < lp)
    }

    pub fn object_type(&self) -> &str {
        &self.core.object_type
    }

    pub async fn send(&self, records: Vec<Record>) -> Result<()> {
        self.core.send(records).await
    }

    pub async fn send_one(&self, record: Record) -> Result<()> {
        self.core.send(vec![record]).await
    }

    pub async fn sent(&self) -> u64 {
        self.core.sent().await
    }

    /// Flush and close the stream, advancing the watermark to the crawl start
    pub async fn done(&self) -> Result<u64> {
        self.core.finish(Some(self.crawl_started)).await
    }
}

/// Sender that performs a full resync every run
pub struct FullSyncSender {
    core: SenderCore,
}

impl FullSyncSender {
    pub async fn new(agent: Arc<dyn Agent>, object_type: &str) -> Result<Self> {
        let (core, _) = SenderCore::open(agent, object_type).await?;
        Ok(Self { core })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.core.batch_size = batch_size.max(1);
        self
    }

    pub fn object_type(&self) -> &str {
        &self.core.object_type
    }

    pub async fn send(&self, records: Vec<Record>) -> Result<()> {
        self.core.send(records).await
    }

    pub async fn send_one(&self, record: Record) -> Result<()> {
        self.core.send(vec![record]).await
    }

    pub async fn sent(&self) -> u64 {
        self.core.sent().await
    }

    pub async fn done(&self) -> Result<u64> {
        self.core.finish(None).await
    }
}
