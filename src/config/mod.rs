use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_REST_PORT: u16 = 4301;
const DEFAULT_BROWSER_BINARY: &str = "owl-browser";
const DEFAULT_BROWSER_START_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BROWSER_STOP_TIMEOUT_SECS: u64 = 3;
const DEFAULT_SOCKET_POOL_SIZE: usize = 64;
const DEFAULT_SOCKET_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DIAGNOSTICS_WINDOW_BYTES: usize = 16 * 1024;
const DEFAULT_STREAM_REGISTRY_CAPACITY: usize = 64;
const DEFAULT_STOPPED_HISTORY_CAPACITY: usize = 64;
const DEFAULT_MJPEG_BOUNDARY: &str = "owlboundary";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket control-plane port (default: 4300).
    port: Option<u16>,
    /// HTTP REST surface port — health check + MJPEG relay (default: 4301).
    rest_port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,clawd_browser=trace" (default: "info").
    log: Option<String>,
    /// Path to the headless browser binary.
    browser_binary: Option<String>,
    browser_start_timeout_secs: Option<u64>,
    browser_stop_timeout_secs: Option<u64>,
    socket_pool_size: Option<usize>,
    socket_pool_acquire_timeout_secs: Option<u64>,
    default_request_timeout_ms: Option<u64>,
    diagnostics_window_bytes: Option<usize>,
    stream_registry_capacity: Option<usize>,
    stopped_history_capacity: Option<usize>,
    mjpeg_boundary: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub rest_port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub browser: BrowserConfig,
    pub video: VideoConfig,
}

/// Process-supervisor and dispatcher configuration.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Path to the child executable (env `CLAWD_BROWSER_BIN`).
    pub browser_binary: String,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub socket_pool_size: usize,
    pub socket_pool_acquire_timeout_secs: u64,
    pub default_request_timeout_ms: u64,
    pub diagnostics_window_bytes: usize,
}

/// Live-stream registry and MJPEG relay configuration.
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub stream_registry_capacity: usize,
    pub stopped_history_capacity: usize,
    pub mjpeg_boundary: String,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        rest_port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let rest_port = rest_port.or(toml.rest_port).unwrap_or(DEFAULT_REST_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let browser_binary = std::env::var("CLAWD_BROWSER_BIN")
            .ok()
            .filter(|v| !v.is_empty())
            .or(toml.browser_binary)
            .unwrap_or_else(|| DEFAULT_BROWSER_BINARY.to_string());

        let browser = BrowserConfig {
            browser_binary,
            start_timeout_secs: toml
                .browser_start_timeout_secs
                .unwrap_or(DEFAULT_BROWSER_START_TIMEOUT_SECS),
            stop_timeout_secs: toml
                .browser_stop_timeout_secs
                .unwrap_or(DEFAULT_BROWSER_STOP_TIMEOUT_SECS),
            socket_pool_size: toml.socket_pool_size.unwrap_or(DEFAULT_SOCKET_POOL_SIZE),
            socket_pool_acquire_timeout_secs: toml
                .socket_pool_acquire_timeout_secs
                .unwrap_or(DEFAULT_SOCKET_POOL_ACQUIRE_TIMEOUT_SECS),
            default_request_timeout_ms: toml
                .default_request_timeout_ms
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            diagnostics_window_bytes: toml
                .diagnostics_window_bytes
                .unwrap_or(DEFAULT_DIAGNOSTICS_WINDOW_BYTES),
        };

        let video = VideoConfig {
            stream_registry_capacity: toml
                .stream_registry_capacity
                .unwrap_or(DEFAULT_STREAM_REGISTRY_CAPACITY),
            stopped_history_capacity: toml
                .stopped_history_capacity
                .unwrap_or(DEFAULT_STOPPED_HISTORY_CAPACITY),
            mjpeg_boundary: toml
                .mjpeg_boundary
                .unwrap_or_else(|| DEFAULT_MJPEG_BOUNDARY.to_string()),
        };

        Self {
            port,
            rest_port,
            data_dir,
            log,
            browser,
            video,
        }
    }
}

// ─── Hot-reloadable config subset ─────────────────────────────────────────────

/// Non-critical config fields that can be changed without restarting the daemon.
///
/// Only the log level is meaningfully hot-reloadable here: the browser binary
/// path, timeouts, and pool sizing are all startup-only — changing them live
/// would mean re-spawning the child or resizing an established socket pool,
/// neither of which this daemon attempts.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
}

/// Watches `config.toml` for changes and reloads non-critical fields.
///
/// The watcher uses the `notify` crate (kqueue on macOS, inotify on Linux)
/// to detect file modifications. Only `log_level` is reloaded; port and the
/// browser/video fields require a full restart.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `{data_dir}/config.toml` for changes.
    ///
    /// Returns `None` if the watcher could not be created (non-fatal; the
    /// daemon runs fine without hot-reload).
    pub fn start(data_dir: &Path) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let initial = load_hot_config(&config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    // Only act on modify/create events
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level {
                                info!(log_level = %new_config.log_level, "config.toml reloaded");
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                // Watch the data_dir (parent of config.toml) since watching a
                // non-existent file fails on some platforms.
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

/// Load only the hot-reloadable fields from config.toml.
fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/clawd-browser
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("clawd-browser");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/clawd-browser or ~/.local/share/clawd-browser
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("clawd-browser");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("clawd-browser");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\clawd-browser
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("clawd-browser");
        }
    }
    // Fallback
    PathBuf::from(".clawd-browser")
}
