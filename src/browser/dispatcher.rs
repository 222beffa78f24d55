//! Command dispatcher — builds envelopes and routes them through whichever
//! transport is currently active.
//!
//! Exposes two facades over the same machinery: `send()` returns the
//! assigned request id immediately and delivers its outcome to an arbitrary
//! `Sink`, while `call()` is a thin synchronous-feeling wrapper that awaits
//! completion via a one-shot sink and translates the result into a `Result`.

use crate::browser::registry::{CommandOutcome, RequestRegistry, Sink};
use crate::browser::transport::pipe::PipeTransport;
use crate::browser::transport::socket_pool::{PoolError, SocketPoolTransport};
use crate::browser::transport::TransportMode;
use crate::browser::wire;
use crate::observability::LatencyTracker;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("invalid params: expected a JSON object, got {0}")]
    InvalidParams(&'static str),
    #[error("request timed out")]
    Timeout,
    #[error("browser stopped before a response arrived")]
    Stopped,
    #[error("browser reported an error: {0}")]
    BrowserError(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outcome of the synchronous `call()` facade.
pub type OperationResult = Result<Value, DispatchError>;

/// Build one wire-protocol line for `method`/`params`. The envelope merge
/// flattens the top-level keys of a `params` object directly
/// alongside `id` and `method` rather than nesting them under a `params`
/// key — this matches the child's flat command shape. A flattened value
/// that is itself an object or array is serialized as `null`; callers
/// needing complex nesting must pre-serialize it into a scalar (e.g. a
/// JSON-encoded string) before passing it as a param.
fn build_envelope(id: u32, method: &str, params: Option<Value>) -> Result<String, DispatchError> {
    let mut obj = Map::new();
    obj.insert("id".to_string(), Value::from(id));
    obj.insert("method".to_string(), Value::from(method));
    match params {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (k, v) in map {
                let v = match v {
                    Value::Object(_) | Value::Array(_) => Value::Null,
                    scalar => scalar,
                };
                obj.insert(k, v);
            }
        }
        Some(other) => {
            return Err(DispatchError::InvalidParams(match other {
                Value::Array(_) => "array",
                Value::String(_) => "string",
                Value::Number(_) => "number",
                Value::Bool(_) => "bool",
                _ => "value",
            }))
        }
    }
    Ok(Value::Object(obj).to_string())
}

enum ActiveTransport {
    Pipe(PipeTransport),
    SocketPool(Arc<SocketPoolTransport>),
}

pub struct Dispatcher {
    registry: Arc<RequestRegistry>,
    transport: RwLock<ActiveTransport>,
    default_timeout: Duration,
    socket_pool_acquire_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RequestRegistry>,
        pipe: PipeTransport,
        default_timeout: Duration,
        socket_pool_acquire_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport: RwLock::new(ActiveTransport::Pipe(pipe)),
            default_timeout,
            socket_pool_acquire_timeout,
        }
    }

    /// One-directional upgrade from the pipe transport to the socket pool.
    /// Called once, after the diagnostics/response-stream race resolves via
    /// the shared `UpgradeGate`. A second call simply replaces the
    /// active transport again — callers are expected to call this at most
    /// once per spawn.
    pub async fn upgrade_to_socket_pool(&self, pool: Arc<SocketPoolTransport>) {
        *self.transport.write().await = ActiveTransport::SocketPool(pool);
    }

    pub async fn mode(&self) -> TransportMode {
        match &*self.transport.read().await {
            ActiveTransport::Pipe(_) => TransportMode::Pipe,
            ActiveTransport::SocketPool(_) => TransportMode::SocketPool,
        }
    }

    /// Dispatch `method`/`params`, returning the assigned request id once
    /// the envelope has been handed to the active transport. The outcome is
    /// delivered to `sink` asynchronously, whenever it arrives (or the
    /// request times out or the browser stops).
    pub async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        sink: Sink,
    ) -> Result<u32, DispatchError> {
        let id = self.registry.next_id();
        let line = build_envelope(id, method, params)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        self.registry.add(id, timeout, sink).await;

        let guard = self.transport.read().await;
        match &*guard {
            ActiveTransport::Pipe(pipe) => {
                if pipe.enqueue(line).is_err() {
                    drop(guard);
                    self.registry.remove(id).await;
                    return Err(DispatchError::Transport("pipe closed".to_string()));
                }
            }
            ActiveTransport::SocketPool(pool) => {
                let pool = pool.clone();
                drop(guard);
                let registry = self.registry.clone();
                let acquire_timeout = self.socket_pool_acquire_timeout;
                tokio::spawn(async move {
                    let outcome = Self::run_socket_pool_call(&pool, &line, acquire_timeout, timeout).await;
                    registry.complete(id, outcome).await;
                });
            }
        }
        Ok(id)
    }

    async fn run_socket_pool_call(
        pool: &Arc<SocketPoolTransport>,
        line: &str,
        acquire_timeout: Duration,
        call_timeout: Duration,
    ) -> CommandOutcome {
        let mut session = match pool.acquire(acquire_timeout).await {
            Ok(s) => s,
            Err(e) => return CommandOutcome::Error(e.to_string()),
        };
        let resp = match session.call(line, call_timeout).await {
            Ok(resp) => resp,
            Err(PoolError::CommandTimeout) => return CommandOutcome::Timeout,
            Err(e) => return CommandOutcome::Error(e.to_string()),
        };
        if let Some(err) = wire::extract_error(&resp) {
            return CommandOutcome::Error(err);
        }
        match wire::extract_field_raw(&resp, "result") {
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(v) => CommandOutcome::Result(v),
                Err(_) => CommandOutcome::Error("malformed result payload".to_string()),
            },
            None => CommandOutcome::Error("response had neither result nor error".to_string()),
        }
    }

    /// Synchronous-feeling facade: dispatch and await completion.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> OperationResult {
        let tracker = LatencyTracker::start(format!("browser.call:{method}"));
        let (tx, rx) = oneshot::channel();
        self.send(method, params, timeout, Sink::OneShot(tx)).await?;
        let outcome = match rx.await {
            Ok(CommandOutcome::Result(v)) => Ok(v),
            Ok(CommandOutcome::Error(e)) => Err(DispatchError::BrowserError(e)),
            Ok(CommandOutcome::Timeout) => Err(DispatchError::Timeout),
            Ok(CommandOutcome::Stopped) => Err(DispatchError::Stopped),
            Err(_) => Err(DispatchError::Transport("sink dropped before completion".to_string())),
        };
        tracker.finish();
        outcome
    }
}
