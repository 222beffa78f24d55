//! Live-stream orchestration: ties the stream registry and shared-memory
//! frame reader to the browser's control plane. This is the layer
//! `rest::routes::video`'s relay handler calls into; it owns the
//! `startLiveStream`/`stopLiveStream` round-trips so the HTTP layer only
//! ever deals with `StreamContext` handles and JPEG bytes.

pub mod shm_reader;
pub mod stream_registry;

pub use shm_reader::{FrameReader, FrameReaderError, VideoFrame};
pub use stream_registry::{StoppedRecord, StreamContext, StreamError, StreamRegistry};

use crate::browser::{BrowserCallError, BrowserManager};
use base64::Engine as _;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum VideoError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("browser call failed: {0}")]
    Browser(#[from] BrowserCallError),
    #[error("startLiveStream reported failure")]
    StartFailed,
    #[error("startLiveStream response is missing shm_name")]
    MissingShmName,
}

/// In-process counters backing `GET /video/stats`. Plain atomics, reset on
/// daemon restart — there is no persistent stats journal.
#[derive(Default)]
pub struct StreamStats {
    pub active_streams: AtomicU64,
    pub active_clients: AtomicU64,
    pub total_frames_sent: AtomicU64,
    pub total_bytes_sent: AtomicU64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_streams: self.active_streams.load(Ordering::Relaxed),
            active_clients: self.active_clients.load(Ordering::Relaxed),
            total_frames_sent: self.total_frames_sent.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub active_streams: u64,
    pub active_clients: u64,
    pub total_frames_sent: u64,
    pub total_bytes_sent: u64,
}

/// Outcome of `VideoManager::start_stream` — the relay handler needs to know
/// whether it is the first consumer (so it can treat a connect failure as
/// "nothing else is watching, safe to fully tear down") or one of several.
pub struct StartedStream {
    pub context: Arc<StreamContext>,
    pub joined_existing: bool,
}

/// Per-viewport live-stream registry plus the control-plane glue that starts
/// and stops streams on the browser. An `AppContext` holds exactly one of
/// these.
pub struct VideoManager {
    registry: StreamRegistry,
    stats: StreamStats,
}

impl VideoManager {
    pub fn new(capacity: usize, history_capacity: usize) -> Self {
        Self {
            registry: StreamRegistry::new(capacity, history_capacity),
            stats: StreamStats::default(),
        }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn record_frame(&self, bytes: usize) {
        self.stats.total_frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Start (or join) the live stream for `viewport`. If a reader is
    /// already active for this viewport the call short-circuits without
    /// touching the control plane at all.
    pub async fn start_stream(
        &self,
        browser: &BrowserManager,
        viewport: &str,
        fps: u32,
        quality: Option<u32>,
    ) -> Result<StartedStream, VideoError> {
        if let Some(ctx) = self.registry.get(viewport).await {
            ctx.client_count.fetch_add(1, Ordering::AcqRel);
            self.stats.active_clients.fetch_add(1, Ordering::Relaxed);
            return Ok(StartedStream {
                context: ctx,
                joined_existing: true,
            });
        }

        // A previous run of this viewport may still be sitting in the
        // stopped-history set; clear it so a relay loop that joins the
        // freshly (re)started context doesn't see a stale stop signal.
        self.registry.clear_stopped(viewport).await;

        let mut params = json!({ "viewport_id": viewport, "fps": fps });
        if let Some(q) = quality {
            params["quality"] = json!(q);
        }
        let resp = browser.call("startLiveStream", Some(params), None).await?;

        let success = resp.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        if !success {
            return Err(VideoError::StartFailed);
        }
        let shm_available = resp
            .get("shm_available")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        // When shared memory isn't available the context carries no reader
        // and the relay loop falls back to polling frames over IPC.
        let shm_name = if shm_available {
            Some(
                resp.get("shm_name")
                    .and_then(|v| v.as_str())
                    .ok_or(VideoError::MissingShmName)?
                    .to_string(),
            )
        } else {
            None
        };

        let ctx = self.registry.start(viewport, shm_name.as_deref()).await?;
        self.stats.active_streams.fetch_add(1, Ordering::Relaxed);
        self.stats.active_clients.fetch_add(1, Ordering::Relaxed);
        Ok(StartedStream {
            context: ctx,
            joined_existing: false,
        })
    }

    /// Explicit stop — marks should-stop and notifies the child best-effort.
    /// A failed `stopLiveStream` round-trip does not undo the local stop; it
    /// only means the child's own state must reconcile asynchronously.
    pub async fn stop_stream(&self, browser: &BrowserManager, viewport: &str) {
        if self.registry.stop(viewport, "stop requested").await {
            self.stats.active_streams.fetch_sub(1, Ordering::Relaxed);
        }
        let params = json!({ "viewport_id": viewport });
        if let Err(e) = browser.call("stopLiveStream", Some(params), None).await {
            tracing::warn!(viewport, err = %e, "stopLiveStream call failed — local stop still applied");
        }
    }

    /// Called by a relay loop as it exits. `natural_disconnect` is true when
    /// the loop stopped because its HTTP client went away
    /// rather than because an explicit stop was already observed; in that
    /// case this is the one place that tells the child to stop producing.
    pub async fn on_relay_exit(
        &self,
        browser: &BrowserManager,
        viewport: &str,
        was_already_stopped: bool,
        natural_disconnect: bool,
    ) {
        let was_last = self.registry.cleanup_if_last(viewport, "relay loop exited").await;
        self.stats.active_clients.fetch_sub(1, Ordering::Relaxed);
        if was_last {
            self.stats.active_streams.fetch_sub(1, Ordering::Relaxed);
        }
        if natural_disconnect && !was_already_stopped {
            let params = json!({ "viewport_id": viewport });
            if let Err(e) = browser.call("stopLiveStream", Some(params), None).await {
                tracing::warn!(viewport, err = %e, "stopLiveStream on client disconnect failed");
            }
        }
    }

    /// Fetch the next frame for `ctx`, bounded by `wait_timeout`. Uses the
    /// shared-memory reader when the context has one;
    /// otherwise falls back to an IPC round-trip (`captureFrame`), which the
    /// child answers with a base64-encoded JPEG when no shared-memory ring
    /// was available for this viewport. Returns `None` on timeout or error —
    /// the relay loop treats either as "no frame this tick", not fatal.
    pub async fn fetch_frame(
        &self,
        browser: &BrowserManager,
        ctx: &StreamContext,
        viewport: &str,
        wait_timeout: Duration,
    ) -> Option<VideoFrame> {
        match &ctx.reader {
            Some(reader) => {
                reader.wait(wait_timeout).await.ok()?;
                reader.read().ok()
            }
            None => {
                let params = json!({ "viewport_id": viewport });
                let resp = browser
                    .call("captureFrame", Some(params), Some(wait_timeout))
                    .await
                    .ok()?;
                let encoded = resp.get("jpeg_base64").and_then(|v| v.as_str())?;
                let jpeg = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .ok()?;
                Some(VideoFrame {
                    sequence: resp.get("sequence").and_then(|v| v.as_u64()).unwrap_or(0),
                    jpeg,
                    width: resp.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    height: resp.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    captured_at: std::time::Instant::now(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_snapshot_reflects_recorded_frames() {
        let stats = StreamStats::default();
        stats.active_streams.fetch_add(2, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.active_streams, 2);
        assert_eq!(snap.total_frames_sent, 0);
    }

    #[test]
    fn record_frame_updates_counters() {
        let mgr = VideoManager::new(4, 4);
        mgr.record_frame(1024);
        mgr.record_frame(2048);
        let snap = mgr.stats();
        assert_eq!(snap.total_frames_sent, 2);
        assert_eq!(snap.total_bytes_sent, 3072);
    }
}
