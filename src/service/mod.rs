//! Service loop
//!
//! `service-run-no-restarts` runs [`ServiceRunner`]: one export session over
//! every configured integration per interval tick, until SIGTERM or SIGINT.
//! A stop request abandons the in-flight integration call, closes its handle
//! and reports the rest of the cycle as cancelled before the loop exits.

use crate::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use crate::config::{validate_config_result, AgentConfig};
use crate::pipeline::{JsonlSink, RecordSink};
use crate::plugin::{PluginHost, SubprocessLoader};
use crate::session::{ExportSession, SessionCommand, SessionReport};
use crate::signals::{shutdown_channel, stopped};
use crate::{metrics, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Plugin host launching integration binaries from the configured directory
pub fn subprocess_host(config: &AgentConfig, root: &Path) -> PluginHost {
    let loader = SubprocessLoader::new(config.integrations_dir(root))
        .with_handshake_timeout(config.service.handshake_timeout());
    PluginHost::new(Arc::new(loader)).with_call_timeout(config.service.call_timeout())
}

pub struct ServiceRunner {
    config: AgentConfig,
    host: PluginHost,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    interval: Duration,
}

impl ServiceRunner {
    pub fn new(
        config: AgentConfig,
        host: PluginHost,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let interval = config.service.export_interval();
        Self {
            config,
            host,
            checkpoints,
            sink,
            interval,
        }
    }

    /// Validate `config` and open the on-disk stores under `root`
    pub fn open(root: &Path, config: AgentConfig) -> Result<Self> {
        validate_config_result(&config)?;
        let checkpoints = SqliteCheckpointStore::open_in(root)?;
        let host = subprocess_host(&config, root);
        Ok(Self::new(
            config,
            host,
            Arc::new(checkpoints),
            Arc::new(JsonlSink::new(root)),
        ))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one export session over every configured integration
    pub async fn run_cycle(&self, stop: watch::Receiver<bool>) -> Result<SessionReport> {
        let mut session = ExportSession::new(
            SessionCommand::Export,
            self.config.clone(),
            self.host.clone(),
            self.checkpoints.clone(),
            self.sink.clone(),
        )
        .with_stop(stop);

        session.setup(self.config.integrations.clone())?;
        session.run_export().await
    }

    /// Run cycles until `stop` turns true. Returns the number of cycles run.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<u64> {
        info!(
            interval_secs = self.interval.as_secs(),
            integrations = self.config.integrations.len(),
            "Service loop started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    cycles += 1;
                    match self.run_cycle(stop.clone()).await {
                        Ok(report) if report.is_success() => {
                            info!(cycle = cycles, records = report.total_records(), "Export cycle complete");
                        }
                        Ok(report) => {
                            for failed in report.failed() {
                                warn!(cycle = cycles, integration = %failed.id, error = ?failed.error, "Integration failed in cycle");
                            }
                        }
                        Err(e) => error!(cycle = cycles, error = %e, "Export cycle failed"),
                    }
                    debug!(cycle = cycles, metrics = %metrics::encode_metrics(), "Metrics snapshot");
                }
                _ = stopped(&mut stop) => break,
            }

            if *stop.borrow() {
                break;
            }
        }

        info!(cycles, "Service loop stopped");
        Ok(cycles)
    }

    /// Run until SIGTERM/SIGINT
    pub async fn run_with_signals(&self) -> Result<u64> {
        let stop = shutdown_channel()?;
        self.run(stop).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::pipeline::MemorySink;
    use crate::plugin::InProcessLoader;
    use agent_rpc::{
        Agent, ExportConfig, ExportResult, Integration, IntegrationConfig, IntegrationId,
        IncrementalSender, OnboardExportResult, OnboardExportType, ValidationResult,
    };
    use async_trait::async_trait;

    #[derive(Default)]
    struct Ticker {
        agent: Option<Arc<dyn Agent>>,
    }

    #[async_trait]
    impl Integration for Ticker {
        async fn init(&mut self, agent: Arc<dyn Agent>) -> agent_rpc::Result<()> {
            self.agent = Some(agent);
            Ok(())
        }

        async fn export(&mut self, _config: ExportConfig) -> agent_rpc::Result<ExportResult> {
            let agent = self
                .agent
                .clone()
                .ok_or_else(|| agent_rpc::RpcError::integration("not initialized"))?;
            let sender = IncrementalSender::new(agent, "work.issue").await?;
            let mut record = agent_rpc::Record::new();
            record.insert("key".into(), "OPS-1".into());
            sender.send_one(record).await?;
            sender.done().await?;
            Ok(ExportResult::default())
        }

        async fn validate_config(
            &mut self,
            _config: ExportConfig,
        ) -> agent_rpc::Result<ValidationResult> {
            Ok(ValidationResult::default())
        }

        async fn onboard_export(
            &mut self,
            _object_type: OnboardExportType,
            _config: ExportConfig,
        ) -> agent_rpc::Result<OnboardExportResult> {
            Ok(OnboardExportResult::not_supported())
        }
    }

    fn runner(sink: Arc<MemorySink>, checkpoints: Arc<MemoryCheckpointStore>) -> ServiceRunner {
        let id = IntegrationId::untyped("ticker");
        let mut config = AgentConfig::new("acme");
        config.integrations = vec![IntegrationConfig::new(id.clone())];

        let loader = InProcessLoader::new().with(id, Ticker::default);
        ServiceRunner::new(config, PluginHost::new(Arc::new(loader)), checkpoints, sink)
            .with_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_cycles_until_stopped() {
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let runner = runner(sink.clone(), checkpoints.clone());
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { runner.run(rx).await });
        tokio::time::sleep(Duration::from_millis(70)).await;
        tx.send(true).unwrap();

        let cycles = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(cycles >= 2);
        let delivered = sink.records("work.issue").len() as u64;
        assert!(delivered <= cycles && delivered + 1 >= cycles);
        assert_eq!(checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_already_stopped_runs_nothing_after_first_tick() {
        let sink = Arc::new(MemorySink::new());
        let runner = runner(sink.clone(), Arc::new(MemoryCheckpointStore::new()));
        let (_tx, rx) = watch::channel(true);

        let cycles = runner.run(rx).await.unwrap();
        assert!(cycles <= 1);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ServiceRunner::open(dir.path(), AgentConfig::default())
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
