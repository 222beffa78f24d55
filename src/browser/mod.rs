//! Browser control plane: process supervision, the diagnostics scanner, the
//! pending-request registry, the two command transports, and the command
//! dispatcher that sits in front of them.

pub mod diagnostics;
pub mod dispatcher;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod wire;

use dispatcher::DispatchError;
use serde_json::Value;
use std::time::Duration;
use supervisor::{Supervisor, SupervisorError, SupervisorOptions, SupervisorState};

/// Top-level handle an `AppContext` holds. Wraps the supervisor and exposes
/// the lifecycle operations and pass-through command dispatch that the
/// daemon's RPC surface calls into (SPEC_FULL.md §4.A addition).
pub struct BrowserManager {
    supervisor: Supervisor,
}

impl BrowserManager {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            supervisor: Supervisor::new(options),
        }
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.supervisor.stop().await
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.supervisor.restart().await
    }

    pub async fn state(&self) -> SupervisorState {
        self.supervisor.state().await
    }

    pub async fn is_ready(&self) -> bool {
        matches!(self.supervisor.state().await, SupervisorState::Ready)
    }

    /// Forward an arbitrary `method`/`params` pair to the running browser —
    /// the path used both by the daemon's own `browser.*` RPC methods and
    /// by the pass-through forwarder for methods the daemon doesn't
    /// recognize itself.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, BrowserCallError> {
        let dispatcher = self
            .supervisor
            .dispatcher()
            .await
            .ok_or(BrowserCallError::NotRunning)?;
        dispatcher
            .call(method, params, timeout)
            .await
            .map_err(BrowserCallError::Dispatch)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BrowserCallError {
    #[error("browser is not running")]
    NotRunning,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
