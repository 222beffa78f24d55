pub mod browser;
pub mod config;
pub mod doctor;
pub mod ipc;
pub mod observability;
pub mod rest;
pub mod retry;
pub mod video;

// Re-export auth so main.rs can use clawd_browser::auth directly.
pub use ipc::auth;

use std::sync::Arc;

use config::DaemonConfig;
use ipc::event::EventBroadcaster;

/// Shared application state passed to every RPC handler and background task.
///
/// Replaces the process-wide singletons the daemon used to reach into
/// directly: every subsystem lives behind an `Arc` field here and is cloned
/// into handlers and background tasks instead.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub started_at: std::time::Instant,
    /// Local WebSocket/REST auth token. Every new WS connection must send a
    /// `daemon.auth` RPC with this token before any other method call; the
    /// video relay accepts it as a Bearer header or `owl_token` cookie.
    /// Empty string means auth is disabled (not recommended).
    pub auth_token: String,
    /// Browser process supervisor, IPC dispatcher, and request registry.
    pub browser: Arc<browser::BrowserManager>,
    /// Per-viewport live-stream orchestration backing the MJPEG relay.
    pub video: Arc<video::VideoManager>,
}
