//! Unit tests for the HTTP health endpoints.
//!
//! The daemon exposes two: a raw-HTTP `GET /health` sharing the WebSocket
//! control-plane port (`ipc::run`, for clients without a WS library), and
//! the Axum-routed `GET /health` on the REST surface alongside `/video/*`.

use clawd_browser::browser::supervisor::SupervisorOptions;
use clawd_browser::browser::BrowserManager;
use clawd_browser::config::DaemonConfig;
use clawd_browser::ipc::event::EventBroadcaster;
use clawd_browser::video::VideoManager;
use clawd_browser::AppContext;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn make_test_ctx(dir: &TempDir, port: u16, rest_port: u16) -> Arc<AppContext> {
    let data_dir = dir.path().to_path_buf();
    let config = DaemonConfig::new(
        Some(port),
        Some(rest_port),
        Some(data_dir.clone()),
        Some("error".to_string()),
    );

    let supervisor_options = SupervisorOptions {
        binary: config.browser.browser_binary.clone().into(),
        start_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        diagnostics_window: config.browser.diagnostics_window_bytes,
        socket_pool_size: 4,
        socket_pool_acquire_timeout: Duration::from_secs(1),
        default_request_timeout: Duration::from_millis(500),
    };

    Arc::new(AppContext {
        config: Arc::new(config),
        broadcaster: Arc::new(EventBroadcaster::new()),
        started_at: std::time::Instant::now(),
        auth_token: String::new(),
        browser: Arc::new(BrowserManager::new(supervisor_options)),
        video: Arc::new(VideoManager::new(8, 8)),
    })
}

async fn fetch(port: u16, path: &str) -> (String, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf).into_owned();

    let body_start = response
        .find("\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(response.len());
    let body = response[body_start..].to_string();
    (response, body)
}

#[tokio::test]
async fn test_ipc_health_endpoint_response_fields() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let rest_port = find_free_port();
    let ctx = make_test_ctx(&dir, port, rest_port).await;

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        let _ = clawd_browser::ipc::run(ctx_clone).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (response, body) = fetch(port, "/health ").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("Content-Type: application/json"));

    let json: serde_json::Value = serde_json::from_str(&body).expect("body is not valid JSON");
    assert_eq!(json["status"], "degraded");
    assert!(json["version"].is_string());
    assert!(json["uptime_secs"].is_number());
    assert_eq!(json["browser"]["state"], "Stopped");
    assert_eq!(json["browser"]["ready"], false);
    assert_eq!(json["port"].as_u64().unwrap(), port as u64);

    assert!(
        json.get("auth_token").is_none(),
        "response must not expose auth_token"
    );
    assert!(
        json.get("data_dir").is_none(),
        "response must not expose data_dir"
    );
}

#[tokio::test]
async fn test_rest_health_endpoint_response_fields() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let rest_port = find_free_port();
    let ctx = make_test_ctx(&dir, port, rest_port).await;

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        let _ = clawd_browser::rest::start_rest_server(ctx_clone).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (response, body) = fetch(rest_port, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let json: serde_json::Value = serde_json::from_str(&body).expect("body is not valid JSON");
    // The configured browser binary never starts in this test, so the
    // supervisor stays `Stopped` and the health status reports "degraded"
    // rather than "ok" — see `HealthStatus::ok`.
    assert_eq!(json["status"], "degraded");
    assert!(json["version"].is_string());
    assert!(json["uptime_secs"].is_number());
    assert_eq!(json["browser"]["state"], "Stopped");
    assert!(json["video"].is_object());
}
