//! Transport seam between the plugin host and integration code

use crate::Result;
use agent_rpc::wire::{Call, CallOutcome};
use agent_rpc::{Agent, Capabilities, IntegrationId};
use async_trait::async_trait;
use std::sync::Arc;

/// Starts the execution unit of an integration
#[async_trait]
pub trait IntegrationLoader: Send + Sync {
    /// Locate and start `id`, returning a ready connection.
    ///
    /// Fails with `NotFound` when the integration cannot be located and
    /// `LaunchFailed` when it starts but does not become ready.
    async fn launch(&self, id: &IntegrationId) -> Result<Box<dyn IntegrationConnection>>;
}

/// A live channel to one integration instance
#[async_trait]
pub trait IntegrationConnection: Send {
    /// Capabilities announced when the connection was established
    fn capabilities(&self) -> Capabilities;

    /// Execute one call. Agent callbacks made while it runs go to `agent`.
    ///
    /// `Ok` carries the integration's own outcome. `Err` means the transport
    /// failed. In-process transports may unwind; the caller catches panics.
    async fn call(&mut self, call: Call, agent: Arc<dyn Agent>) -> Result<CallOutcome>;

    /// Ask the integration to exit and release the execution unit
    async fn shutdown(&mut self) -> Result<()>;

    /// Forcefully stop the execution unit without waiting
    fn kill(&mut self) {}
}
