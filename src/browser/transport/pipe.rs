//! Pipe transport — a single dedicated I/O loop multiplexing over the
//! child's command-in / response-out pipes.
//!
//! The command-writable side is serviced from an ordered write queue
//! populated by producers (the dispatcher). The response-readable side
//! fills a large line-buffered accumulator; each complete newline-terminated
//! JSON object is demultiplexed by id and its raw `result` slice (or `error`
//! string) handed to the registered sink.

use crate::browser::diagnostics::{classify_line, DiagnosticsEvent};
use crate::browser::registry::{CommandOutcome, RequestRegistry};
use crate::browser::transport::UpgradeGate;
use crate::browser::wire;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(thiserror::Error, Debug)]
pub enum PipeError {
    #[error("pipe transport closed")]
    Closed,
}

/// Handle to the running pipe I/O loop. Cloneable — every producer holds one.
#[derive(Clone)]
pub struct PipeTransport {
    write_tx: mpsc::UnboundedSender<String>,
}

impl PipeTransport {
    /// Spawn the writer and reader loops. Returns the transport handle plus
    /// the reader loop's join handle; the caller should treat the reader
    /// loop exiting as transport-fatal (child exited or pipe EOF).
    pub fn spawn(
        stdin: ChildStdin,
        stdout: ChildStdout,
        registry: Arc<RequestRegistry>,
        upgrade_gate: Arc<UpgradeGate>,
        diag_tx: mpsc::UnboundedSender<DiagnosticsEvent>,
        on_fatal: impl Fn() + Send + Sync + 'static,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (write_tx, write_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(Self::run_writer(stdin, write_rx));

        let reader_handle = tokio::spawn(Self::run_reader(
            stdout,
            registry,
            upgrade_gate,
            diag_tx,
            on_fatal,
        ));

        (Self { write_tx }, reader_handle)
    }

    /// Enqueue one envelope line (already serialized, without a trailing
    /// newline) for the writer loop.
    pub fn enqueue(&self, line: String) -> Result<(), PipeError> {
        self.write_tx.send(line).map_err(|_| PipeError::Closed)
    }

    async fn run_writer(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!(err = %e, "pipe write failed");
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                warn!(err = %e, "pipe write failed");
                break;
            }
            if let Err(e) = stdin.flush().await {
                warn!(err = %e, "pipe flush failed");
                break;
            }
        }
    }

    async fn run_reader(
        stdout: ChildStdout,
        registry: Arc<RequestRegistry>,
        upgrade_gate: Arc<UpgradeGate>,
        diag_tx: mpsc::UnboundedSender<DiagnosticsEvent>,
        on_fatal: impl Fn() + Send + Sync + 'static,
    ) {
        // 8 MiB accumulator — generous enough for screenshot-sized
        // payloads without quadratic reallocation.
        let mut lines = BufReader::with_capacity(8 * 1024 * 1024, stdout).lines();
        loop {
            registry.reap_expired().await;

            let next =
                tokio::time::timeout(std::time::Duration::from_millis(200), lines.next_line())
                    .await;
            let line = match next {
                Ok(Ok(Some(l))) => l,
                Ok(Ok(None)) => {
                    debug!("pipe response stream EOF");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(err = %e, "pipe response stream error");
                    break;
                }
                Err(_timeout) => continue,
            };

            // `READY`/license markers and the transport-upgrade marker can
            // all land on the response stream instead of the diagnostics
            // stream depending on what the child writes where; forward
            // whichever this scanner sees. For the upgrade marker, the
            // gate makes whichever side sees it second a no-op; `Ready`
            // and `LicenseError` are naturally idempotent downstream since
            // the readiness channel is a one-shot that only consumes the
            // first event it receives.
            match classify_line(&line) {
                Some(DiagnosticsEvent::TransportUpgrade { socket_path }) => {
                    if upgrade_gate.claim() {
                        let _ = diag_tx.send(DiagnosticsEvent::TransportUpgrade { socket_path });
                    }
                    continue;
                }
                Some(event @ DiagnosticsEvent::Ready)
                | Some(event @ DiagnosticsEvent::LicenseError { .. }) => {
                    let _ = diag_tx.send(event);
                    continue;
                }
                None => {}
            }

            let Some(id) = wire::extract_id(&line) else {
                continue;
            };
            if id == 0 {
                // Shutdown sentinel — no response expected.
                continue;
            }

            if let Some(err) = wire::extract_error(&line) {
                registry.complete(id, CommandOutcome::Error(err)).await;
                continue;
            }

            if let Some(raw_result) = wire::extract_field_raw(&line, "result") {
                match serde_json::from_str::<serde_json::Value>(raw_result) {
                    Ok(value) => {
                        registry.complete(id, CommandOutcome::Result(value)).await;
                    }
                    Err(e) => {
                        error!(err = %e, id, "failed to parse result slice");
                    }
                }
            }
        }

        registry.fail_all_stopped().await;
        on_fatal();
    }
}
