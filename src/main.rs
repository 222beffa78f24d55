use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use clawd_browser::browser::supervisor::SupervisorOptions;
use clawd_browser::browser::BrowserManager;
use clawd_browser::config::{ConfigWatcher, DaemonConfig};
use clawd_browser::ipc::auth;
use clawd_browser::ipc::event::EventBroadcaster;
use clawd_browser::video::VideoManager;
use clawd_browser::{doctor, ipc, rest, AppContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "clawd-browser",
    about = "Headless-browser control-plane daemon — async IPC multiplexer and MJPEG live-video relay",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON-RPC WebSocket control-plane port
    #[arg(long, env = "CLAWD_PORT")]
    port: Option<u16>,

    /// HTTP REST/MJPEG surface port
    #[arg(long, env = "CLAWD_REST_PORT")]
    rest_port: Option<u16>,

    /// Data directory for config.toml and the local auth token
    #[arg(long, env = "CLAWD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CLAWD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CLAWD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default if no subcommand is given).
    Serve,
    /// Check the environment the daemon would run in: the browser binary,
    /// the configured ports, and the data directory.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Doctor) => {
            let config = DaemonConfig::new(args.port, args.rest_port, args.data_dir, args.log);
            let results = doctor::run_doctor(&config).await;
            doctor::print_doctor_results(&results);
            let failed = results.iter().filter(|r| !r.passed).count();
            std::process::exit(if failed == 0 { 0 } else { 1 });
        }
        None | Some(Command::Serve) => {
            run_server(args.port, args.rest_port, args.data_dir, args.log).await?;
        }
    }

    Ok(())
}

async fn run_server(
    port: Option<u16>,
    rest_port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<()> {
    let config = DaemonConfig::new(port, rest_port, data_dir, log);
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.data_dir.display()
        )
    })?;

    if let Some(watcher) = ConfigWatcher::start(&config.data_dir) {
        // Held for the process lifetime — dropping it would stop the watch.
        std::mem::forget(watcher);
    }

    let auth_token =
        auth::get_or_create_token(&config.data_dir).context("failed to load auth token")?;

    let supervisor_options = SupervisorOptions {
        binary: config.browser.browser_binary.clone().into(),
        start_timeout: Duration::from_secs(config.browser.start_timeout_secs),
        stop_timeout: Duration::from_secs(config.browser.stop_timeout_secs),
        diagnostics_window: config.browser.diagnostics_window_bytes,
        socket_pool_size: config.browser.socket_pool_size,
        socket_pool_acquire_timeout: Duration::from_secs(
            config.browser.socket_pool_acquire_timeout_secs,
        ),
        default_request_timeout: Duration::from_millis(config.browser.default_request_timeout_ms),
    };

    let ctx = Arc::new(AppContext {
        config: Arc::new(config.clone()),
        broadcaster: Arc::new(EventBroadcaster::new()),
        started_at: std::time::Instant::now(),
        auth_token,
        browser: Arc::new(BrowserManager::new(supervisor_options)),
        video: Arc::new(VideoManager::new(
            config.video.stream_registry_capacity,
            config.video.stopped_history_capacity,
        )),
    });

    info!(
        port = config.port,
        rest_port = config.rest_port,
        data_dir = %config.data_dir.display(),
        "starting clawd-browser"
    );

    let rest_ctx = ctx.clone();
    let rest_task = tokio::spawn(async move {
        if let Err(e) = rest::start_rest_server(rest_ctx).await {
            warn!(err = %e, "REST server exited");
        }
    });

    let result = ipc::run(ctx).await;
    rest_task.abort();
    result
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("clawd-browser.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
