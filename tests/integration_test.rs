//! Integration tests for the clawd-browser JSON-RPC control plane.
//! Spins up a real daemon on a free port and drives it over a WebSocket
//! client, the way a Flutter/web client would.

use clawd_browser::browser::supervisor::SupervisorOptions;
use clawd_browser::browser::BrowserManager;
use clawd_browser::config::DaemonConfig;
use clawd_browser::ipc::event::EventBroadcaster;
use clawd_browser::video::VideoManager;
use clawd_browser::AppContext;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Start a daemon on a random port and return the WebSocket URL. The
/// browser binary is left at its configured default ("owl-browser"), which
/// is never actually present in the test sandbox — these tests exercise the
/// control plane itself and the `NotRunning` error path, not a live child.
async fn start_test_daemon() -> (String, Arc<AppContext>) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = get_free_port();
    let rest_port = get_free_port();

    let config = DaemonConfig::new(Some(port), Some(rest_port), Some(data_dir.clone()), Some("warn".into()));

    let supervisor_options = SupervisorOptions {
        binary: config.browser.browser_binary.clone().into(),
        start_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        diagnostics_window: config.browser.diagnostics_window_bytes,
        socket_pool_size: 4,
        socket_pool_acquire_timeout: Duration::from_secs(1),
        default_request_timeout: Duration::from_millis(500),
    };

    let ctx = Arc::new(AppContext {
        config: Arc::new(config),
        broadcaster: Arc::new(EventBroadcaster::new()),
        started_at: std::time::Instant::now(),
        auth_token: String::new(),
        browser: Arc::new(BrowserManager::new(supervisor_options)),
        video: Arc::new(VideoManager::new(8, 8)),
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        clawd_browser::ipc::run(ctx_server).await.ok();
    });

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{}", ctx.config.port);
    (url, ctx)
}

fn get_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn ws_rpc(url: &str, method: &str, params: Value) -> Value {
    let (mut ws, _) = connect_async(url).await.expect("ws connect failed");

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params
    });
    ws.send(Message::Text(serde_json::to_string(&request).unwrap()))
        .await
        .unwrap();

    loop {
        let msg = ws.next().await.unwrap().unwrap();
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text).unwrap();
            if v.get("id").is_some() {
                return v;
            }
        }
    }
}

#[tokio::test]
async fn test_daemon_ping() {
    let (url, _ctx) = start_test_daemon().await;
    let resp = ws_rpc(&url, "daemon.ping", json!({})).await;
    assert_eq!(resp["result"]["pong"], true);
}

#[tokio::test]
async fn test_daemon_status() {
    let (url, _ctx) = start_test_daemon().await;
    let resp = ws_rpc(&url, "daemon.status", json!({})).await;
    let result = &resp["result"];
    assert!(result["version"].is_string());
    assert!(result["uptime"].is_number());
    assert_eq!(result["browser"]["state"], "Stopped");
    assert!(result["video"].is_object());
}

#[tokio::test]
async fn test_browser_state_starts_stopped() {
    let (url, _ctx) = start_test_daemon().await;
    let resp = ws_rpc(&url, "browser.state", json!({})).await;
    assert_eq!(resp["result"]["state"], "Stopped");
}

#[tokio::test]
async fn test_browser_start_fails_without_binary() {
    let (url, _ctx) = start_test_daemon().await;
    // The configured binary ("owl-browser") doesn't exist on the test host,
    // so the supervisor's spawn fails and surfaces as a browser error.
    let resp = ws_rpc(&url, "browser.start", json!({})).await;
    assert_eq!(resp["error"]["code"], -32013);
}

#[tokio::test]
async fn test_video_start_fails_when_browser_not_running() {
    let (url, _ctx) = start_test_daemon().await;
    let resp = ws_rpc(
        &url,
        "video.start",
        json!({ "viewport_id": "main" }),
    )
    .await;
    assert!(resp.get("error").is_some(), "expected error: {resp:?}");
}

#[tokio::test]
async fn test_video_start_missing_viewport_id_is_invalid_params() {
    let (url, _ctx) = start_test_daemon().await;
    let resp = ws_rpc(&url, "video.start", json!({})).await;
    assert_eq!(resp["error"]["code"], -32602);
}

#[tokio::test]
async fn test_video_stats_starts_empty() {
    let (url, _ctx) = start_test_daemon().await;
    let resp = ws_rpc(&url, "video.stats", json!({})).await;
    assert_eq!(resp["result"]["active_streams"], 0);
    assert_eq!(resp["result"]["active_clients"], 0);
}

#[tokio::test]
async fn test_unmatched_method_forwards_to_browser_and_fails_not_running() {
    let (url, _ctx) = start_test_daemon().await;
    // Anything outside daemon.*/browser.*/video.* is forwarded verbatim to
    // the running browser process rather than rejected as METHOD_NOT_FOUND.
    let resp = ws_rpc(&url, "navigate", json!({ "url": "https://example.com" })).await;
    assert_eq!(resp["error"]["code"], -32010);
}

#[tokio::test]
async fn test_auth_required_when_token_configured() {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = get_free_port();
    let rest_port = get_free_port();
    let config = DaemonConfig::new(Some(port), Some(rest_port), Some(data_dir.clone()), Some("warn".into()));

    let supervisor_options = SupervisorOptions {
        binary: config.browser.browser_binary.clone().into(),
        start_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        diagnostics_window: config.browser.diagnostics_window_bytes,
        socket_pool_size: 4,
        socket_pool_acquire_timeout: Duration::from_secs(1),
        default_request_timeout: Duration::from_millis(500),
    };

    let ctx = Arc::new(AppContext {
        config: Arc::new(config),
        broadcaster: Arc::new(EventBroadcaster::new()),
        started_at: std::time::Instant::now(),
        auth_token: "secret-token".to_string(),
        browser: Arc::new(BrowserManager::new(supervisor_options)),
        video: Arc::new(VideoManager::new(8, 8)),
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        clawd_browser::ipc::run(ctx_server).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let url = format!("ws://127.0.0.1:{}", ctx.config.port);

    // First message is not daemon.auth -> rejected.
    let resp = ws_rpc(&url, "daemon.ping", json!({})).await;
    assert_eq!(resp["error"]["code"], -32004);

    // Correct auth handshake followed by a real call succeeds.
    let (mut ws, _) = connect_async(&url).await.unwrap();
    let auth_req = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "daemon.auth",
        "params": { "token": "secret-token" }
    });
    ws.send(Message::Text(serde_json::to_string(&auth_req).unwrap()))
        .await
        .unwrap();
    let auth_resp = ws.next().await.unwrap().unwrap();
    if let Message::Text(text) = auth_resp {
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["result"]["authenticated"], true);
    } else {
        panic!("expected text frame");
    }
}
