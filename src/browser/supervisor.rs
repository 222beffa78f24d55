//! Process supervisor — owns the child's lifecycle: spawn, readiness
//! detection, transport wiring, graceful shutdown, and forced termination.

use crate::browser::diagnostics::{run_scanner, DiagnosticsEvent};
use crate::browser::dispatcher::Dispatcher;
use crate::browser::registry::RequestRegistry;
use crate::browser::transport::pipe::PipeTransport;
use crate::browser::transport::socket_pool::SocketPoolTransport;
use crate::browser::transport::UpgradeGate;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("browser already running")]
    AlreadyRunning,
    #[error("browser is not running")]
    NotRunning,
    #[error("failed to spawn browser process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("browser did not become ready within the start timeout")]
    StartTimeout,
    #[error("browser reported a license error: {0}")]
    LicenseError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    LicenseError(String),
    Error(String),
}

enum ReadyOutcome {
    Ready,
    License(String),
}

struct Running {
    child: Child,
    pipe: PipeTransport,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RequestRegistry>,
}

/// Configuration the supervisor needs to spawn and wire a child; owned by
/// the caller (`BrowserManager`) and passed in at construction so this type
/// has no dependency on the config module's shape.
pub struct SupervisorOptions {
    pub binary: PathBuf,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub diagnostics_window: usize,
    pub socket_pool_size: usize,
    pub socket_pool_acquire_timeout: Duration,
    pub default_request_timeout: Duration,
}

pub struct Supervisor {
    options: SupervisorOptions,
    state: Arc<RwLock<SupervisorState>>,
    running: RwLock<Option<Running>>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            state: Arc::new(RwLock::new(SupervisorState::Stopped)),
            running: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> SupervisorState {
        self.state.read().await.clone()
    }

    pub async fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.running.read().await.as_ref().map(|r| r.dispatcher.clone())
    }

    /// Spawn the child, wire the diagnostics scanner and pipe transport
    /// together, and wait up to `start_timeout` for a `Ready` line. A
    /// license error short-circuits the wait and is surfaced directly.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.running.read().await.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        *self.state.write().await = SupervisorState::Starting;

        let instance_id = uuid::Uuid::new_v4().to_string();
        let mut child = Command::new(&self.options.binary)
            .arg("--instance-id")
            .arg(&instance_id)
            .env("CLAWD_BROWSER_INSTANCE_ID", &instance_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(instance_id = %instance_id, "spawned browser child");

        let stdin = child.stdin.take().expect("stdin piped at spawn");
        let stdout = child.stdout.take().expect("stdout piped at spawn");
        let stderr = child.stderr.take().expect("stderr piped at spawn");

        let registry = Arc::new(RequestRegistry::new());
        let upgrade_gate = Arc::new(UpgradeGate::new());
        let (diag_tx, mut diag_rx) = mpsc::unbounded_channel::<DiagnosticsEvent>();

        tokio::spawn(run_scanner(stderr, self.options.diagnostics_window, diag_tx.clone()));

        let fatal_state = self.state.clone();
        let (pipe, _reader_handle) = PipeTransport::spawn(
            stdin,
            stdout,
            registry.clone(),
            upgrade_gate.clone(),
            diag_tx,
            move || {
                let fatal_state = fatal_state.clone();
                tokio::spawn(async move {
                    *fatal_state.write().await =
                        SupervisorState::Error("browser transport closed unexpectedly".to_string());
                });
            },
        );

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            pipe.clone(),
            self.options.default_request_timeout,
            self.options.socket_pool_acquire_timeout,
        ));

        let (ready_tx, ready_rx) = oneshot::channel::<ReadyOutcome>();
        let socket_pool_size = self.options.socket_pool_size;
        let state_for_task = self.state.clone();
        let dispatcher_for_task = dispatcher.clone();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            while let Some(event) = diag_rx.recv().await {
                match event {
                    DiagnosticsEvent::Ready => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(ReadyOutcome::Ready);
                        }
                    }
                    DiagnosticsEvent::LicenseError { detail } => {
                        let msg = detail.unwrap_or_else(|| "license error".to_string());
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(ReadyOutcome::License(msg));
                        } else {
                            *state_for_task.write().await = SupervisorState::LicenseError(msg);
                        }
                    }
                    DiagnosticsEvent::TransportUpgrade { socket_path } => {
                        // Canonical gate check: whichever stream observes
                        // the marker first wins, regardless of origin.
                        if !upgrade_gate.claim() {
                            continue;
                        }
                        match SocketPoolTransport::connect(
                            PathBuf::from(&socket_path),
                            socket_pool_size,
                        )
                        .await
                        {
                            Ok(pool) => {
                                dispatcher_for_task.upgrade_to_socket_pool(pool).await;
                                info!(socket_path = %socket_path, "upgraded to socket-pool transport");
                            }
                            Err(e) => {
                                warn!(err = %e, "failed to connect socket pool after upgrade advertisement");
                            }
                        }
                    }
                }
            }
        });

        let outcome = tokio::time::timeout(self.options.start_timeout, ready_rx).await;
        match outcome {
            Ok(Ok(ReadyOutcome::Ready)) => {
                *self.state.write().await = SupervisorState::Ready;
                *self.running.write().await = Some(Running {
                    child,
                    pipe,
                    dispatcher,
                    registry,
                });
                Ok(())
            }
            Ok(Ok(ReadyOutcome::License(msg))) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                *self.state.write().await = SupervisorState::LicenseError(msg.clone());
                Err(SupervisorError::LicenseError(msg))
            }
            Ok(Err(_recv_dropped)) | Err(_timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                *self.state.write().await =
                    SupervisorState::Error("start timed out waiting for readiness".to_string());
                Err(SupervisorError::StartTimeout)
            }
        }
    }

    /// Best-effort graceful shutdown (send the `id:0` shutdown sentinel plus,
    /// on Unix, a `SIGTERM`), wait up to `stop_timeout`, falling back to a
    /// forced `SIGKILL`. Every pending request is failed with `Stopped`
    /// regardless of which path terminated the child.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut guard = self.running.write().await;
        let Some(running) = guard.as_mut() else {
            return Err(SupervisorError::NotRunning);
        };

        let _ = running.pipe.enqueue(r#"{"id":0,"method":"shutdown"}"#.to_string());
        #[cfg(unix)]
        send_sigterm(&running.child);

        let exited = tokio::time::timeout(self.options.stop_timeout, running.child.wait()).await;
        if exited.is_err() {
            if let Err(e) = running.child.start_kill() {
                warn!(err = %e, "failed to force-kill browser process");
            }
            let _ = running.child.wait().await;
        }

        running.registry.fail_all_stopped().await;
        *guard = None;
        drop(guard);
        *self.state.write().await = SupervisorState::Stopped;
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        if self.running.read().await.is_some() {
            self.stop().await?;
        }
        self.start().await
    }
}

/// Send `SIGTERM` to the child alongside the JSON shutdown envelope. If the
/// child never reacts to either, `stop_timeout` still elapses and `stop()`
/// falls through to `start_kill` (`SIGKILL`).
#[cfg(unix)]
fn send_sigterm(child: &Child) {
    let Some(pid) = child.id() else { return };
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_equality_distinguishes_error_detail() {
        assert_ne!(
            SupervisorState::Error("a".to_string()),
            SupervisorState::Error("b".to_string())
        );
        assert_eq!(SupervisorState::Ready, SupervisorState::Ready);
    }
}
