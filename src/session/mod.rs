//! Export session
//!
//! An [`ExportSession`] runs one command against the integrations it targets.
//! Integrations run one after another: each is loaded, initialized, invoked and
//! closed before the next one starts. Whatever happens, the handle in use is
//! closed before the session reports.
//!
//! ```text
//! Created --setup--> Configured --run_*--> Running --teardown--> Closed
//!    |                   |                                         ^
//!    +-------------------+------------- setup failure -------------+
//! ```

mod output;
pub mod probe;

pub use output::{IntegrationReport, OnboardOutput, SessionReport, ValidateOutput};
pub use probe::{redact_url, GitRemoteProbe, RepoProbe};

use crate::checkpoint::CheckpointStore;
use crate::config::{is_plain_file_name, AgentConfig};
use crate::pipeline::{ExportAgent, RecordSink};
use crate::plugin::{PluginHandle, PluginHost};
use crate::signals::stopped;
use crate::{metrics, AgentError, Result};
use agent_rpc::wire::CallValue;
use agent_rpc::{ExportConfig, IntegrationConfig, OnboardExportType, ValidationResult};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Command a session executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Export,
    ValidateConfig,
    OnboardExport,
}

impl SessionCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::ValidateConfig => "validate-config",
            Self::OnboardExport => "export-onboard-data",
        }
    }

    /// Commands that only make sense against one integration
    pub fn requires_single_integration(&self) -> bool {
        !matches!(self, Self::Export)
    }
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Configured,
    Running,
    Closed,
}

/// What to ask each integration for
enum Invocation {
    Export,
    ValidateConfig,
    OnboardExport(OnboardExportType),
}

pub struct ExportSession {
    command: SessionCommand,
    config: AgentConfig,
    host: PluginHost,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    probe: Arc<dyn RepoProbe>,
    stop: Option<watch::Receiver<bool>>,
    reprocess_historical: bool,
    integrations: Vec<IntegrationConfig>,
    current: Option<PluginHandle>,
    state: SessionState,
}

impl ExportSession {
    pub fn new(
        command: SessionCommand,
        config: AgentConfig,
        host: PluginHost,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            command,
            config,
            host,
            checkpoints,
            sink,
            probe: Arc::new(GitRemoteProbe::new()),
            stop: None,
            reprocess_historical: false,
            integrations: Vec::new(),
            current: None,
            state: SessionState::Created,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn RepoProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Abandon the session once `stop` becomes true
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_reprocess_historical(mut self, reprocess: bool) -> Self {
        self.reprocess_historical = reprocess;
        self
    }

    pub fn command(&self) -> SessionCommand {
        self.command
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check the integrations this session will run
    pub fn setup(&mut self, integrations: Vec<IntegrationConfig>) -> Result<()> {
        match self.state {
            SessionState::Created => {}
            SessionState::Closed => return Err(AgentError::SessionClosed),
            state => {
                return Err(AgentError::Other(format!(
                    "session is already {:?}",
                    state
                )))
            }
        }

        if let Err(e) = self.check_integrations(&integrations) {
            self.state = SessionState::Closed;
            metrics::record_session(self.command.as_str(), "invalid");
            return Err(e);
        }

        self.integrations = integrations;
        self.state = SessionState::Configured;
        Ok(())
    }

    fn check_integrations(&self, integrations: &[IntegrationConfig]) -> Result<()> {
        if self.config.customer_id.trim().is_empty() {
            return Err(AgentError::ConfigInvalid("customer_id is required".to_string()));
        }
        if integrations.is_empty() {
            return Err(AgentError::ConfigInvalid(
                "no integrations configured".to_string(),
            ));
        }
        if self.command.requires_single_integration() && integrations.len() != 1 {
            return Err(AgentError::MultipleNotAllowed {
                command: self.command.to_string(),
                count: integrations.len(),
            });
        }

        let mut seen = HashSet::new();
        for integration in integrations {
            if integration.id.is_empty() {
                return Err(AgentError::ConfigInvalid(
                    "integration name cannot be empty".to_string(),
                ));
            }
            if !is_plain_file_name(&integration.id.name) {
                return Err(AgentError::ConfigInvalid(format!(
                    "integration name {:?} cannot contain path separators",
                    integration.id.name
                )));
            }
            if !seen.insert(&integration.id) {
                return Err(AgentError::ConfigInvalid(format!(
                    "integration {} is listed twice",
                    integration.id
                )));
            }
        }
        Ok(())
    }

    fn begin(&mut self, command: SessionCommand) -> Result<()> {
        match self.state {
            SessionState::Configured if self.command == command => {
                self.state = SessionState::Running;
                Ok(())
            }
            SessionState::Closed => Err(AgentError::SessionClosed),
            SessionState::Configured => Err(AgentError::Other(format!(
                "session was set up for {}, not {}",
                self.command, command
            ))),
            state => Err(AgentError::Other(format!(
                "cannot run {} while session is {:?}",
                command, state
            ))),
        }
    }

    /// Export every configured integration
    ///
    /// One integration failing does not stop the others. The report carries
    /// each integration's outcome.
    pub async fn run_export(&mut self) -> Result<SessionReport> {
        self.begin(SessionCommand::Export)?;
        let mut report = SessionReport::default();

        for integration in self.integrations.clone() {
            if self.is_stopped() {
                report
                    .integrations
                    .push(IntegrationReport::cancelled(&integration.id));
                continue;
            }

            let agent = Arc::new(self.agent_for(&integration));
            let started = Instant::now();
            let result = self
                .run_integration(&integration, Invocation::Export, agent.clone())
                .await;

            let mut entry = IntegrationReport::new(&integration.id, started.elapsed());
            entry.records = agent.delivered().into_iter().collect();
            if let Err(e) = result {
                entry.cancelled = matches!(e, AgentError::Cancelled);
                entry.error = Some(e.to_string());
            }
            report.integrations.push(entry);
        }

        self.teardown().await?;

        let status = if report.is_success() { "success" } else { "failure" };
        metrics::record_session(self.command.as_str(), status);
        info!(
            integrations = report.integrations.len(),
            failed = report.failed().count(),
            records = report.total_records(),
            "Export session finished"
        );
        Ok(report)
    }

    /// Ask the integration to check its configuration
    ///
    /// When the integration reports a repository URL and no errors, the
    /// repository must also be reachable for validation to succeed.
    pub async fn run_validate_config(&mut self) -> Result<ValidateOutput> {
        self.begin(SessionCommand::ValidateConfig)?;
        let integration = self.single_integration().await?;

        let agent = Arc::new(self.agent_for(&integration));
        let output = match self
            .run_integration(&integration, Invocation::ValidateConfig, agent)
            .await
        {
            Ok(CallValue::ValidateConfig(result)) => {
                let probe = self.probe.clone();
                check_validation(probe.as_ref(), &integration, result).await
            }
            Ok(other) => ValidateOutput::failed(&unexpected(&integration, &other)),
            Err(e) => ValidateOutput::failed(&e),
        };

        self.teardown().await?;

        let status = if output.success { "success" } else { "failure" };
        metrics::record_session(self.command.as_str(), status);
        Ok(output)
    }

    /// Fetch onboarding data of `object_type`
    ///
    /// The type is checked before anything is loaded.
    pub async fn run_onboard_export(&mut self, object_type: &str) -> Result<OnboardOutput> {
        self.begin(SessionCommand::OnboardExport)?;

        let object_type: OnboardExportType = match object_type.parse() {
            Ok(t) => t,
            Err(e) => {
                self.teardown().await?;
                metrics::record_session(self.command.as_str(), "invalid");
                return Err(AgentError::Rpc(e));
            }
        };
        let integration = self.single_integration().await?;

        let agent = Arc::new(self.agent_for(&integration));
        let output = match self
            .run_integration(&integration, Invocation::OnboardExport(object_type), agent)
            .await
        {
            Ok(CallValue::OnboardExport(result)) => OnboardOutput::from(result),
            Ok(other) => OnboardOutput::failed(&unexpected(&integration, &other)),
            Err(e) => OnboardOutput::failed(&e),
        };

        self.teardown().await?;

        let status = if output.is_success() { "success" } else { "failure" };
        metrics::record_session(self.command.as_str(), status);
        Ok(output)
    }

    /// Close whatever is still held. Runs its body once; later calls are no-ops.
    pub async fn teardown(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.release().await
    }

    async fn single_integration(&mut self) -> Result<IntegrationConfig> {
        let count = match self.integrations.as_slice() {
            [only] => return Ok(only.clone()),
            all => all.len(),
        };
        self.teardown().await?;
        Err(AgentError::MultipleNotAllowed {
            command: self.command.to_string(),
            count,
        })
    }

    fn agent_for(&self, integration: &IntegrationConfig) -> ExportAgent {
        ExportAgent::new(
            integration.id.clone(),
            self.checkpoints.clone(),
            self.sink.clone(),
        )
        .with_reprocess_historical(self.reprocess_historical)
    }

    fn is_stopped(&self) -> bool {
        self.stop.as_ref().map(|s| *s.borrow()).unwrap_or(false)
    }

    /// load, init, invoke, close
    async fn run_integration(
        &mut self,
        integration: &IntegrationConfig,
        invocation: Invocation,
        agent: Arc<ExportAgent>,
    ) -> Result<CallValue> {
        let id = integration.id.to_string();
        let started = Instant::now();
        let export_config = self
            .config
            .export_config(integration, self.reprocess_historical);

        let result = self.invoke(integration, invocation, agent, export_config).await;
        let closed = self.release().await;

        let result = match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(integration = %id, error = %close_err, "Close failed after error");
                Err(e)
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(_) => {
                info!(integration = %id, command = %self.command, secs = elapsed, "Integration finished");
                metrics::record_integration_run(&id, "success", elapsed);
            }
            Err(e) => {
                error!(integration = %id, command = %self.command, error = %e, "Integration failed");
                metrics::record_integration_run(&id, "failure", elapsed);
            }
        }
        result
    }

    async fn invoke(
        &mut self,
        integration: &IntegrationConfig,
        invocation: Invocation,
        agent: Arc<ExportAgent>,
        export_config: ExportConfig,
    ) -> Result<CallValue> {
        let handle = self.host.load(&integration.id).await?;
        let handle = self.current.insert(handle);

        let call = async {
            handle.init(agent).await?;
            match invocation {
                Invocation::Export => handle.export(export_config).await.map(CallValue::Export),
                Invocation::ValidateConfig => handle
                    .validate_config(export_config)
                    .await
                    .map(CallValue::ValidateConfig),
                Invocation::OnboardExport(object_type) => handle
                    .onboard_export(object_type, export_config)
                    .await
                    .map(CallValue::OnboardExport),
            }
        };

        match self.stop.clone() {
            Some(mut stop) => {
                tokio::select! {
                    result = call => result,
                    _ = stopped(&mut stop) => {
                        warn!(integration = %integration.id, "Stop requested, abandoning integration call");
                        Err(AgentError::Cancelled)
                    }
                }
            }
            None => call.await,
        }
    }

    async fn release(&mut self) -> Result<()> {
        match self.current.take() {
            Some(mut handle) => handle.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for ExportSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed && self.state != SessionState::Created {
            warn!(command = %self.command, state = ?self.state, "Export session dropped before teardown");
        }
    }
}

fn unexpected(integration: &IntegrationConfig, value: &CallValue) -> AgentError {
    AgentError::RpcFailure {
        id: integration.id.to_string(),
        message: format!("unexpected reply {:?}", value),
    }
}

/// Repository URLs count only when the integration reported no errors
async fn check_validation(
    probe: &dyn RepoProbe,
    integration: &IntegrationConfig,
    result: ValidationResult,
) -> ValidateOutput {
    let mut errors = result.errors;

    if let (true, Some(repo_url)) = (errors.is_empty(), result.repo_url.as_deref()) {
        let redacted = redact_url(repo_url);
        info!(integration = %integration.id, url = %redacted, "Probing repository");
        if let Err(e) = probe.probe(repo_url).await {
            warn!(integration = %integration.id, url = %redacted, error = %e, "Repository probe failed");
            errors.push(format!("could not connect to {}: {}", redacted, e));
        }
    }

    ValidateOutput::new(result.server_version, errors)
}
