//! Subprocess transport
//!
//! Each integration is a separate executable in the integrations directory
//! speaking the JSON-lines protocol over its stdin and stdout. Its stderr is
//! re-logged by the agent.

use super::loader::{IntegrationConnection, IntegrationLoader};
use crate::{AgentError, Result};
use agent_rpc::wire::{
    read_message, write_message, Call, CallOutcome, Callback, CallbackOutcome, HostMessage,
    PluginMessage, PROTOCOL_VERSION,
};
use agent_rpc::{Agent, Capabilities, IntegrationId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Default time an integration gets to send its hello
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time an integration gets to exit after a shutdown message
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stderr lines kept for crash reports
const STDERR_TAIL_LINES: usize = 20;

/// Last lines an integration wrote to stderr
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.iter().cloned().collect()
    }
}

/// Launches integration binaries from a directory
#[derive(Debug, Clone)]
pub struct SubprocessLoader {
    dir: PathBuf,
    handshake_timeout: Duration,
}

impl SubprocessLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Executable that serves `id`
    pub fn binary_path(&self, id: &IntegrationId) -> PathBuf {
        binary_path(&self.dir, &id.name)
    }
}

fn binary_path(dir: &Path, name: &str) -> PathBuf {
    if cfg!(windows) {
        dir.join(format!("{}.exe", name))
    } else {
        dir.join(name)
    }
}

#[async_trait]
impl IntegrationLoader for SubprocessLoader {
    async fn launch(&self, id: &IntegrationId) -> Result<Box<dyn IntegrationConnection>> {
        let path = self.binary_path(id);
        if !path.is_file() {
            return Err(AgentError::NotFound(format!(
                "{} (looked for {})",
                id,
                path.display()
            )));
        }

        let mut cmd = Command::new(&path);
        if let Some(type_name) = id.integration_type.wire_name() {
            cmd.arg("--integration-type").arg(type_name);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(integration = %id, path = %path.display(), "Launching integration");
        let mut child = cmd.spawn().map_err(|e| AgentError::LaunchFailed {
            id: id.to_string(),
            message: e.to_string(),
        })?;

        let launch_failed = |message: &str| AgentError::LaunchFailed {
            id: id.to_string(),
            message: message.to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(|| launch_failed("stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_failed("stdout not captured"))?;
        let tail = StderrTail::new();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relog_stderr(id.clone(), stderr, tail.clone()));
        }

        let conn = RpcConnection::connect(id.clone(), stdout, stdin, self.handshake_timeout)
            .await?
            .with_child(child)
            .with_stderr_tail(tail);
        Ok(Box::new(conn))
    }
}

/// Re-emit every stderr line of the integration through tracing
async fn relog_stderr(id: IntegrationId, stderr: tokio::process::ChildStderr, tail: StderrTail) {
    let integration = id.to_string();
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                info!(target: "integration", integration, "{}", line);
                tail.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(integration, error = %e, "Stopped reading integration stderr");
                break;
            }
        }
    }
}

/// Protocol client over a byte transport, optionally owning the child process
pub struct RpcConnection {
    id: IntegrationId,
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    child: Option<Child>,
    stderr: StderrTail,
    capabilities: Capabilities,
    next_id: u64,
    line: String,
}

impl RpcConnection {
    /// Wait for the integration's hello and check the protocol version
    pub async fn connect<R, W>(
        id: IntegrationId,
        reader: R,
        writer: W,
        handshake_timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = Self {
            id,
            reader: BufReader::new(Box::new(reader)),
            writer: Some(Box::new(writer)),
            child: None,
            stderr: StderrTail::new(),
            capabilities: Capabilities::none(),
            next_id: 1,
            line: String::new(),
        };

        let hello = tokio::time::timeout(
            handshake_timeout,
            read_message::<_, PluginMessage>(&mut conn.reader, &mut conn.line),
        )
        .await;

        match hello {
            Err(_) => Err(conn.launch_failed(format!(
                "no handshake within {}s",
                handshake_timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(conn.launch_failed(format!("handshake failed: {}", e))),
            Ok(Ok(None)) => Err(conn.launch_failed("exited before handshake".to_string())),
            Ok(Ok(Some(PluginMessage::Hello {
                protocol_version,
                capabilities,
            }))) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(conn.launch_failed(format!(
                        "protocol version {} not supported, expected {}",
                        protocol_version, PROTOCOL_VERSION
                    )));
                }
                debug!(integration = %conn.id, capabilities = ?capabilities, "Integration handshake complete");
                conn.capabilities = capabilities;
                Ok(conn)
            }
            Ok(Ok(Some(other))) => Err(conn.launch_failed(format!(
                "expected hello, got {:?}",
                other
            ))),
        }
    }

    /// Attach the child process so shutdown waits for it and drop kills it
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Include `tail` in crash reports
    pub fn with_stderr_tail(mut self, tail: StderrTail) -> Self {
        self.stderr = tail;
        self
    }

    /// The integration went away in the middle of `operation`
    fn crashed(&mut self, operation: &str) -> AgentError {
        let mut message = format!("integration exited during {}", operation);
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                message.push_str(&format!(" ({})", status));
            }
        }
        let tail = self.stderr.lines();
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(&tail.join("\n"));
        }
        AgentError::IntegrationPanic {
            id: self.id.to_string(),
            message,
        }
    }

    fn launch_failed(&self, message: String) -> AgentError {
        AgentError::LaunchFailed {
            id: self.id.to_string(),
            message,
        }
    }

    fn rpc_failure(&self, message: impl std::fmt::Display) -> AgentError {
        AgentError::RpcFailure {
            id: self.id.to_string(),
            message: message.to_string(),
        }
    }

    async fn send(&mut self, message: &HostMessage) -> Result<()> {
        let writer = match self.writer.as_mut() {
            Some(w) => w,
            None => return Err(AgentError::HandleClosed(self.id.to_string())),
        };
        let sent = write_message(writer, message).await;
        sent.map_err(|e| self.rpc_failure(e))
    }
}

/// Answer one callback by calling the host agent
async fn answer_callback(agent: &Arc<dyn Agent>, callback: Callback) -> CallbackOutcome {
    let result = match callback {
        Callback::ExportStarted { object_type } => agent
            .export_started(&object_type)
            .await
            .map(CallbackOutcome::Stream),
        Callback::SendExported { stream, records } => agent
            .send_exported(stream, records)
            .await
            .map(|_| CallbackOutcome::Ack),
        Callback::ExportDone {
            stream,
            last_processed,
        } => agent
            .export_done(stream, last_processed)
            .await
            .map(|_| CallbackOutcome::Ack),
    };
    result.unwrap_or_else(|e| CallbackOutcome::Error(e.to_string()))
}

#[async_trait]
impl IntegrationConnection for RpcConnection {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn call(&mut self, call: Call, agent: Arc<dyn Agent>) -> Result<CallOutcome> {
        let call_id = self.next_id;
        self.next_id += 1;
        let name = call.name();

        self.send(&HostMessage::Call { id: call_id, call }).await?;

        loop {
            let message = read_message::<_, PluginMessage>(&mut self.reader, &mut self.line)
                .await
                .map_err(|e| self.rpc_failure(e))?;

            match message {
                None => return Err(self.crashed(name)),
                Some(PluginMessage::Reply { id, outcome }) if id == call_id => return Ok(outcome),
                Some(PluginMessage::Reply { id, .. }) => {
                    warn!(integration = %self.id, id, "Discarding reply to an abandoned call");
                }
                Some(PluginMessage::Callback { id, callback }) => {
                    let outcome = answer_callback(&agent, callback).await;
                    self.send(&HostMessage::CallbackReply { id, outcome }).await?;
                }
                Some(PluginMessage::Log { level, message }) => agent.log(level, message).await,
                Some(PluginMessage::Hello { .. }) => {
                    warn!(integration = %self.id, "Unexpected second handshake");
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.writer.is_some() {
            if let Err(e) = self.send(&HostMessage::Shutdown).await {
                debug!(integration = %self.id, error = %e, "Shutdown message not delivered");
            }
        }
        // Closing stdin is the second exit signal
        self.writer = None;

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(integration = %self.id, status = %status, "Integration exited");
                Ok(())
            }
            Ok(Err(e)) => Err(AgentError::CloseFailed {
                id: self.id.to_string(),
                message: e.to_string(),
            }),
            Err(_) => {
                warn!(integration = %self.id, "Integration ignored shutdown, killing it");
                let killed = child.kill().await;
                killed.map_err(|e| AgentError::CloseFailed {
                    id: self.id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn kill(&mut self) {
        self.writer = None;
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(integration = %self.id, error = %e, "Kill failed, process already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_rpc::wire::CallValue;
    use agent_rpc::{
        serve, ExportConfig, ExportResult, Integration, IntegrationConfig, OnboardExportResult,
        OnboardExportType, Record, ValidationResult,
    };
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::pipeline::{ExportAgent, MemorySink};
    use agent_rpc::IncrementalSender;
    use tokio::io::duplex;

    struct Echo {
        agent: Option<Arc<dyn Agent>>,
    }

    #[async_trait]
    impl Integration for Echo {
        async fn init(&mut self, agent: Arc<dyn Agent>) -> agent_rpc::Result<()> {
            self.agent = Some(agent);
            Ok(())
        }

        async fn export(&mut self, _config: ExportConfig) -> agent_rpc::Result<ExportResult> {
            let agent = self.agent.clone().expect("init first");
            agent
                .log(agent_rpc::LogLevel::Info, "starting".to_string())
                .await;
            let sender = IncrementalSender::new(agent, "work.issue").await?;
            let mut r = Record::new();
            r.insert("ref_id".to_string(), serde_json::json!("A-1"));
            sender.send_one(r).await?;
            sender.done().await?;
            Ok(ExportResult::default())
        }

        async fn validate_config(
            &mut self,
            _config: ExportConfig,
        ) -> agent_rpc::Result<ValidationResult> {
            Ok(ValidationResult {
                server_version: "9.1".to_string(),
                ..Default::default()
            })
        }

        async fn onboard_export(
            &mut self,
            _object_type: OnboardExportType,
            _config: ExportConfig,
        ) -> agent_rpc::Result<OnboardExportResult> {
            Ok(OnboardExportResult::not_supported())
        }
    }

    async fn connected() -> RpcConnection {
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        tokio::spawn(serve(Echo { agent: None }, plugin_read, plugin_write));
        let (host_read, host_write) = tokio::io::split(host_side);
        RpcConnection::connect(
            IntegrationId::untyped("echo"),
            host_read,
            host_write,
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_callbacks_reach_host_agent() {
        let mut conn = connected().await;
        assert_eq!(conn.capabilities(), Capabilities::all());

        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(MemorySink::new());
        let id = IntegrationId::untyped("echo");
        let agent: Arc<dyn Agent> = Arc::new(ExportAgent::new(id.clone(), checkpoints.clone(), sink.clone()));

        let init = conn.call(Call::Init, agent.clone()).await.unwrap();
        assert_eq!(init, CallOutcome::Ok(CallValue::Init));

        let config = ExportConfig {
            integration: IntegrationConfig::new(id.clone()),
            ..Default::default()
        };
        let outcome = conn.call(Call::Export(config), agent).await.unwrap();
        assert!(matches!(outcome, CallOutcome::Ok(CallValue::Export(_))));
        assert_eq!(sink.records("work.issue").len(), 1);
        assert!(checkpoints.get(&id, "work.issue").unwrap().is_some());

        conn.shutdown().await.unwrap();
        // Calls after shutdown cannot be written
        let err = conn
            .call(Call::Init, Arc::new(ExportAgent::new(id, checkpoints, sink)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::HandleClosed(_)));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (host_side, _plugin_side) = duplex(1024);
        let (r, w) = tokio::io::split(host_side);
        let err = RpcConnection::connect(IntegrationId::untyped("mute"), r, w, Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_protocol_mismatch_is_launch_failure() {
        let (host_side, mut plugin_side) = duplex(1024);
        write_message(
            &mut plugin_side,
            &PluginMessage::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                capabilities: Capabilities::all(),
            },
        )
        .await
        .unwrap();
        let (r, w) = tokio::io::split(host_side);
        let err = RpcConnection::connect(IntegrationId::untyped("future"), r, w, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("protocol version"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let loader = SubprocessLoader::new(temp_dir.path());
        let err = loader
            .launch(&IntegrationId::untyped("nope"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[test]
    fn test_binary_path() {
        let loader = SubprocessLoader::new("/opt/agent/integrations");
        let path = loader.binary_path(&IntegrationId::new("jira", agent_rpc::IntegrationType::Work));
        assert!(path.starts_with("/opt/agent/integrations"));
        assert!(path.to_string_lossy().contains("jira"));
    }
}
