//! MJPEG relay handler — one-shot frame grabs, the long-lived multipart
//! stream, and the `/video/list` / `/video/stats` metadata endpoints.
//!
//! This is the thinnest possible layer over `VideoManager`: every handler
//! here deals only in `StreamContext` handles and JPEG bytes, never touching
//! shared memory or the dispatcher directly (see the module doc comment on
//! `video::mod`).

use crate::ipc::auth::validate_bearer;
use crate::AppContext;
use async_stream::stream;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Deserialize)]
pub struct StreamQuery {
    fps: Option<u32>,
}

/// Every response on this surface is uncacheable — CORS is handled once for
/// the whole router by the `CorsLayer` in `rest::mod`.
fn with_common_headers(mut resp: Response) -> Response {
    resp.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-cache, no-store, must-revalidate".parse().unwrap(),
    );
    resp
}

fn unauthorized() -> Response {
    with_common_headers(
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response(),
    )
}

fn not_found(detail: &str) -> Response {
    with_common_headers(
        (StatusCode::NOT_FOUND, Json(json!({ "error": detail }))).into_response(),
    )
}

/// Authentication contract: consult the `Authorization` header first; if
/// that fails, fall back to a `Cookie: owl_token=<value>` parsed
/// into a synthetic `Bearer <value>` and retry. The cookie path exists
/// because `<img>`/`<video>` tags cannot set custom request headers.
fn authenticate(headers: &HeaderMap, expected_token: &str) -> bool {
    if expected_token.is_empty() {
        return true;
    }
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if validate_bearer(auth, expected_token) {
            return true;
        }
    }
    if let Some(cookie) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        if let Some(token) = parse_owl_token_cookie(cookie) {
            let synthetic = format!("Bearer {token}");
            if validate_bearer(&synthetic, expected_token) {
                return true;
            }
        }
    }
    false
}

fn parse_owl_token_cookie(raw: &str) -> Option<&str> {
    raw.split(';')
        .map(str::trim)
        .find_map(|kv| kv.strip_prefix("owl_token="))
}

/// `GET /video/frame/{viewport}` — one-shot JPEG grab.
pub async fn get_frame(
    State(ctx): State<Arc<AppContext>>,
    Path(viewport): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&headers, &ctx.auth_token) {
        return unauthorized();
    }

    let started = match ctx.video.start_stream(&ctx.browser, &viewport, 1, None).await {
        Ok(s) => s,
        Err(e) => return not_found(&e.to_string()),
    };
    let was_already_stopped = started.context.is_stopped();
    let frame = ctx
        .video
        .fetch_frame(&ctx.browser, &started.context, &viewport, Duration::from_millis(500))
        .await;
    // One-shot grabs never keep the reader attached past this request — the
    // handle we just acquired (join or fresh start) is always released.
    ctx.video
        .on_relay_exit(&ctx.browser, &viewport, was_already_stopped, true)
        .await;

    match frame {
        Some(f) => {
            ctx.video.record_frame(f.jpeg.len());
            let mut resp = (StatusCode::OK, Bytes::from(f.jpeg)).into_response();
            resp.headers_mut()
                .insert(header::CONTENT_TYPE, "image/jpeg".parse().unwrap());
            with_common_headers(resp)
        }
        None => not_found("no frame available for this viewport"),
    }
}

/// `GET /video/stream/{viewport}?fps=N` — long-lived MJPEG relay.
pub async fn get_stream(
    State(ctx): State<Arc<AppContext>>,
    Path(viewport): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&headers, &ctx.auth_token) {
        return unauthorized();
    }

    let fps = query.fps.unwrap_or(10).clamp(1, 60);
    let boundary = ctx.config.video.mjpeg_boundary.clone();
    let content_type = format!("multipart/x-mixed-replace; boundary={boundary}");
    let pace = Duration::from_millis((1000 / fps as u64).max(10));

    let stream_ctx = ctx.clone();
    let body_stream = stream! {
        let ctx = stream_ctx;
        let mut guard = RelayGuard::new(ctx.clone(), viewport.clone());
        let started = match ctx.video.start_stream(&ctx.browser, &viewport, fps, None).await {
            Ok(s) => s,
            Err(e) => {
                warn!(viewport = %viewport, err = %e, "startLiveStream failed — ending stream body early");
                return;
            }
        };
        guard.mark_joined();

        loop {
            let stopped_elsewhere = started.context.is_stopped()
                || ctx.video.registry().was_stopped(&viewport).await;
            if stopped_elsewhere {
                guard.mark_already_stopped();
                break;
            }

            match ctx
                .video
                .fetch_frame(&ctx.browser, &started.context, &viewport, Duration::from_millis(100))
                .await
            {
                Some(frame) => {
                    ctx.video.record_frame(frame.jpeg.len());
                    let mut chunk = Vec::with_capacity(frame.jpeg.len() + 96);
                    chunk.extend_from_slice(
                        format!(
                            "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                            frame.jpeg.len()
                        )
                        .as_bytes(),
                    );
                    chunk.extend_from_slice(&frame.jpeg);
                    chunk.extend_from_slice(b"\r\n");
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(chunk));
                    tokio::time::sleep(pace).await;
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    };

    let mut resp = Response::new(Body::from_stream(body_stream));
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, content_type.parse().unwrap());
    with_common_headers(resp)
}

/// `GET /video/list` — pass-through of the child's own stream inventory.
/// The daemon's local view (`/video/stats`) only covers relays it is
/// actively serving, not every stream the browser knows about.
pub async fn list_streams(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.browser.call("listStreams", None, None).await {
        Ok(v) => with_common_headers(Json(v).into_response()),
        Err(e) => with_common_headers(
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response(),
        ),
    }
}

/// `GET /video/stats` — local relay counters.
pub async fn stats(State(ctx): State<Arc<AppContext>>) -> Response {
    with_common_headers(Json(json!(ctx.video.stats())).into_response())
}

/// RAII cleanup for one relay loop. Exactly one of two things happens after
/// `mark_joined()`: the loop observes an explicit stop and calls
/// `mark_already_stopped()` before breaking, or the HTTP body future is
/// simply dropped (client disconnect / write failure) while still awaiting
/// a frame. Either way `Drop` fires exactly once and reports the outcome to
/// `VideoManager::on_relay_exit`.
struct RelayGuard {
    ctx: Arc<AppContext>,
    viewport: String,
    joined: bool,
    already_stopped: Cell<bool>,
}

impl RelayGuard {
    fn new(ctx: Arc<AppContext>, viewport: String) -> Self {
        Self {
            ctx,
            viewport,
            joined: false,
            already_stopped: Cell::new(false),
        }
    }

    fn mark_joined(&mut self) {
        self.joined = true;
    }

    fn mark_already_stopped(&self) {
        self.already_stopped.set(true);
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if !self.joined {
            return;
        }
        let ctx = self.ctx.clone();
        let viewport = self.viewport.clone();
        let was_already_stopped = self.already_stopped.get();
        // A natural (client-initiated) exit is whatever didn't already
        // observe an explicit stop — covers both a clean break and this
        // guard being dropped mid-wait when the client simply went away.
        let natural_disconnect = !was_already_stopped;
        tokio::spawn(async move {
            ctx.video
                .on_relay_exit(&ctx.browser, &viewport, was_already_stopped, natural_disconnect)
                .await;
        });
    }
}
