//! Plugin host and handles
//!
//! [`PluginHost::load`] starts an integration through the configured loader and
//! returns a [`PluginHandle`]. Every call on a handle goes through one shim
//! that checks the handle state and capability, applies the call timeout and
//! converts a panic into [`AgentError::IntegrationPanic`].

use super::loader::{IntegrationConnection, IntegrationLoader};
use crate::{metrics, AgentError, Result};
use agent_rpc::wire::{Call, CallOutcome, CallValue};
use agent_rpc::{
    panic_message, Agent, Capabilities, ExportConfig, ExportResult, IntegrationId,
    OnboardExportResult, OnboardExportType, ValidationResult,
};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// Default upper bound for one integration call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

type LoadedSet = Arc<Mutex<HashSet<IntegrationId>>>;

fn lock_loaded(loaded: &LoadedSet) -> std::sync::MutexGuard<'_, HashSet<IntegrationId>> {
    loaded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks an integration id as loaded until dropped
struct LoadGuard {
    loaded: LoadedSet,
    id: IntegrationId,
}

impl LoadGuard {
    fn acquire(loaded: &LoadedSet, id: &IntegrationId) -> Result<Self> {
        if !lock_loaded(loaded).insert(id.clone()) {
            return Err(AgentError::AlreadyLoaded(id.to_string()));
        }
        Ok(Self {
            loaded: loaded.clone(),
            id: id.clone(),
        })
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        lock_loaded(&self.loaded).remove(&self.id);
    }
}

/// Loads integrations and tracks which ones are in use
#[derive(Clone)]
pub struct PluginHost {
    loader: Arc<dyn IntegrationLoader>,
    loaded: LoadedSet,
    call_timeout: Duration,
}

impl PluginHost {
    pub fn new(loader: Arc<dyn IntegrationLoader>) -> Self {
        Self {
            loader,
            loaded: Arc::new(Mutex::new(HashSet::new())),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Ids with an open handle
    pub fn loaded(&self) -> Vec<IntegrationId> {
        lock_loaded(&self.loaded).iter().cloned().collect()
    }

    /// Start `id` and connect to it
    pub async fn load(&self, id: &IntegrationId) -> Result<PluginHandle> {
        if id.is_empty() {
            return Err(AgentError::ConfigInvalid(
                "integration id cannot be empty".to_string(),
            ));
        }

        let guard = LoadGuard::acquire(&self.loaded, id)?;
        let conn = self.loader.launch(id).await?;

        metrics::handle_opened();
        info!(integration = %id, capabilities = ?conn.capabilities(), "Integration loaded");
        Ok(PluginHandle {
            id: id.clone(),
            capabilities: conn.capabilities(),
            conn: Some(conn),
            agent: None,
            call_timeout: self.call_timeout,
            guard: Some(guard),
        })
    }
}

/// A loaded integration, owned by exactly one session
pub struct PluginHandle {
    id: IntegrationId,
    capabilities: Capabilities,
    conn: Option<Box<dyn IntegrationConnection>>,
    agent: Option<Arc<dyn Agent>>,
    call_timeout: Duration,
    guard: Option<LoadGuard>,
}

impl PluginHandle {
    pub fn id(&self) -> &IntegrationId {
        &self.id
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Hand the agent callbacks to the integration
    pub async fn init(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        self.agent = Some(agent);
        match self.invoke(Call::Init).await {
            Ok(_) => Ok(()),
            Err(AgentError::IntegrationFailed { id, message })
            | Err(AgentError::RpcFailure { id, message }) => {
                Err(AgentError::InitFailed { id, message })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn export(&mut self, config: ExportConfig) -> Result<ExportResult> {
        match self.invoke(Call::Export(config)).await? {
            CallValue::Export(result) => Ok(result),
            other => Err(self.mismatched("export", &other)),
        }
    }

    pub async fn validate_config(&mut self, config: ExportConfig) -> Result<ValidationResult> {
        match self.invoke(Call::ValidateConfig(config)).await? {
            CallValue::ValidateConfig(result) => Ok(result),
            other => Err(self.mismatched("validate_config", &other)),
        }
    }

    pub async fn onboard_export(
        &mut self,
        object_type: OnboardExportType,
        config: ExportConfig,
    ) -> Result<OnboardExportResult> {
        match self
            .invoke(Call::OnboardExport {
                object_type,
                config,
            })
            .await?
        {
            CallValue::OnboardExport(result) => Ok(result),
            other => Err(self.mismatched("onboard_export", &other)),
        }
    }

    fn mismatched(&self, operation: &str, value: &CallValue) -> AgentError {
        AgentError::RpcFailure {
            id: self.id.to_string(),
            message: format!("{} returned {:?}", operation, value),
        }
    }

    /// The single boundary every integration call crosses
    async fn invoke(&mut self, call: Call) -> Result<CallValue> {
        let id = self.id.to_string();
        let operation = call.name();

        if let Some(required) = call.required_capability() {
            if !self.capabilities.contains(required) {
                return Err(AgentError::Unsupported {
                    id,
                    operation: operation.to_string(),
                });
            }
        }

        let Some(agent) = self.agent.clone() else {
            return Err(AgentError::InitFailed {
                id,
                message: format!("{} called before init", operation),
            });
        };

        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(AgentError::HandleClosed(id)),
        };

        debug!(integration = %id, operation, "Invoking integration");
        let guarded = AssertUnwindSafe(conn.call(call, agent)).catch_unwind();
        let result = tokio::time::timeout(self.call_timeout, guarded).await;

        match result {
            Err(_) => Err(AgentError::Timeout {
                id,
                operation: operation.to_string(),
                secs: self.call_timeout.as_secs(),
            }),
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                Err(self.recovered_panic(operation, message))
            }
            Ok(Ok(Err(AgentError::IntegrationPanic { message, .. }))) => {
                Err(self.recovered_panic(operation, message))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(CallOutcome::Panic(message)))) => {
                Err(self.recovered_panic(operation, message))
            }
            Ok(Ok(Ok(CallOutcome::Error(message)))) => {
                Err(AgentError::IntegrationFailed { id, message })
            }
            Ok(Ok(Ok(CallOutcome::Ok(value)))) => Ok(value),
        }
    }

    fn recovered_panic(&self, operation: &str, message: String) -> AgentError {
        let id = self.id.to_string();
        error!(integration = %id, operation, panic = %message, "Recovered integration panic");
        metrics::record_panic(&id);
        AgentError::IntegrationPanic { id, message }
    }

    /// Release the integration. Closing a closed handle succeeds.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        self.agent = None;
        metrics::handle_closed();
        let _released = self.guard.take();

        let result = AssertUnwindSafe(conn.shutdown()).catch_unwind().await;
        let result = match result {
            Ok(r) => r,
            Err(payload) => Err(AgentError::CloseFailed {
                id: self.id.to_string(),
                message: panic_message(payload.as_ref()),
            }),
        };

        match &result {
            Ok(()) => debug!(integration = %self.id, "Integration closed"),
            Err(e) => {
                error!(integration = %self.id, error = %e, "Integration did not close cleanly");
                conn.kill();
            }
        }
        result
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            error!(integration = %self.id, "Plugin handle dropped without close, killing integration");
            metrics::handle_closed();
            conn.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::InProcessLoader;
    use agent_rpc::{
        Capability, Integration, IntegrationConfig, LogLevel, Record, StreamHandle, StreamId,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct NullAgent;

    #[async_trait]
    impl Agent for NullAgent {
        async fn export_started(&self, _object_type: &str) -> agent_rpc::Result<StreamHandle> {
            Ok(StreamHandle {
                stream_id: StreamId(1),
                last_processed: None,
            })
        }
        async fn send_exported(&self, _s: StreamId, _r: Vec<Record>) -> agent_rpc::Result<()> {
            Ok(())
        }
        async fn export_done(
            &self,
            _s: StreamId,
            _l: Option<DateTime<Utc>>,
        ) -> agent_rpc::Result<()> {
            Ok(())
        }
        async fn log(&self, _level: LogLevel, _message: String) {}
    }

    #[derive(Default)]
    struct Scripted {
        panic_on_export: bool,
        slow_validate: bool,
    }

    #[async_trait]
    impl Integration for Scripted {
        fn capabilities(&self) -> Capabilities {
            Capabilities::none()
                .with(Capability::Export)
                .with(Capability::ValidateConfig)
        }

        async fn init(&mut self, _agent: Arc<dyn Agent>) -> agent_rpc::Result<()> {
            Ok(())
        }

        async fn export(&mut self, _config: ExportConfig) -> agent_rpc::Result<ExportResult> {
            if self.panic_on_export {
                panic!("index out of range");
            }
            Ok(ExportResult::default())
        }

        async fn validate_config(
            &mut self,
            _config: ExportConfig,
        ) -> agent_rpc::Result<ValidationResult> {
            if self.slow_validate {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(agent_rpc::RpcError::integration("bad credentials"))
        }

        async fn onboard_export(
            &mut self,
            _object_type: OnboardExportType,
            _config: ExportConfig,
        ) -> agent_rpc::Result<OnboardExportResult> {
            unreachable!("not declared")
        }
    }

    fn host(panic_on_export: bool, slow_validate: bool) -> PluginHost {
        let loader = InProcessLoader::new().with(IntegrationId::untyped("scripted"), move || {
            Scripted {
                panic_on_export,
                slow_validate,
            }
        });
        PluginHost::new(Arc::new(loader)).with_call_timeout(Duration::from_millis(200))
    }

    fn config() -> ExportConfig {
        ExportConfig {
            integration: IntegrationConfig::new(IntegrationId::untyped("scripted")),
            ..Default::default()
        }
    }

    async fn loaded(host: &PluginHost) -> PluginHandle {
        let mut handle = host.load(&IntegrationId::untyped("scripted")).await.unwrap();
        handle.init(Arc::new(NullAgent)).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let host = host(true, false);
        let mut handle = loaded(&host).await;

        let err = handle.export(config()).await.unwrap_err();
        match err {
            AgentError::IntegrationPanic { id, message } => {
                assert_eq!(id, "scripted");
                assert!(message.contains("index out of range"));
            }
            other => panic!("unexpected {:?}", other),
        }

        handle.close().await.unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_calls_and_close_is_idempotent() {
        let host = host(false, false);
        let mut handle = loaded(&host).await;
        handle.export(config()).await.unwrap();

        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert!(matches!(
            handle.export(config()).await,
            Err(AgentError::HandleClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_capability() {
        let host = host(false, false);
        let mut handle = loaded(&host).await;
        let err = handle
            .onboard_export(OnboardExportType::Users, config())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unsupported { .. }));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_integration_error_and_timeout() {
        let host = host(false, false);
        let mut handle = loaded(&host).await;
        let err = handle.validate_config(config()).await.unwrap_err();
        assert!(matches!(err, AgentError::IntegrationFailed { .. }));
        handle.close().await.unwrap();

        let host = self::host(false, true);
        let mut handle = loaded(&host).await;
        let err = handle.validate_config(config()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_load_rejected_until_released() {
        let host = host(false, false);
        let id = IntegrationId::untyped("scripted");

        let mut first = host.load(&id).await.unwrap();
        assert!(matches!(
            host.load(&id).await,
            Err(AgentError::AlreadyLoaded(_))
        ));

        first.close().await.unwrap();
        let mut second = host.load(&id).await.unwrap();
        second.close().await.unwrap();

        let dropped = host.load(&id).await.unwrap();
        drop(dropped);
        assert!(host.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_load_errors() {
        let host = host(false, false);
        assert!(matches!(
            host.load(&IntegrationId::untyped("")).await,
            Err(AgentError::ConfigInvalid(_))
        ));
        assert!(matches!(
            host.load(&IntegrationId::untyped("missing")).await,
            Err(AgentError::NotFound(_))
        ));
        assert!(host.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_call_before_init() {
        let host = host(false, false);
        let mut handle = host.load(&IntegrationId::untyped("scripted")).await.unwrap();
        assert!(matches!(
            handle.export(config()).await,
            Err(AgentError::InitFailed { .. })
        ));
        handle.close().await.unwrap();
    }
}
