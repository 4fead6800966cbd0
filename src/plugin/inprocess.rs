//! In-process transport
//!
//! Runs integrations compiled into the agent binary. Used for built-in
//! integrations and for tests.

use super::loader::{IntegrationConnection, IntegrationLoader};
use crate::{AgentError, Result};
use agent_rpc::wire::{Call, CallOutcome};
use agent_rpc::{dispatch, Agent, Capabilities, Integration, IntegrationId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a fresh integration instance for every load
pub type IntegrationFactory = Arc<dyn Fn() -> Box<dyn Integration> + Send + Sync>;

/// Registry of integrations that run inside the agent process
#[derive(Default, Clone)]
pub struct InProcessLoader {
    factories: HashMap<IntegrationId, IntegrationFactory>,
}

impl InProcessLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, I>(&mut self, id: IntegrationId, factory: F)
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: Integration + 'static,
    {
        self.factories
            .insert(id, Arc::new(move || Box::new(factory()) as Box<dyn Integration>));
    }

    pub fn with<F, I>(mut self, id: IntegrationId, factory: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: Integration + 'static,
    {
        self.register(id, factory);
        self
    }
}

#[async_trait]
impl IntegrationLoader for InProcessLoader {
    async fn launch(&self, id: &IntegrationId) -> Result<Box<dyn IntegrationConnection>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        let integration = factory();
        tracing::debug!(integration = %id, "Started in-process integration");
        Ok(Box::new(InProcessConnection {
            capabilities: integration.capabilities(),
            integration,
        }))
    }
}

struct InProcessConnection {
    integration: Box<dyn Integration>,
    capabilities: Capabilities,
}

#[async_trait]
impl IntegrationConnection for InProcessConnection {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn call(&mut self, call: Call, agent: Arc<dyn Agent>) -> Result<CallOutcome> {
        Ok(match dispatch(self.integration.as_mut(), call, agent).await {
            Ok(value) => CallOutcome::Ok(value),
            Err(e) => CallOutcome::Error(e.to_string()),
        })
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
