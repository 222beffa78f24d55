//! `video.*` RPC handlers — the WebSocket-side counterpart to the MJPEG
//! relay under `rest::routes::video`; both call into the same
//! `VideoManager` (SPEC_FULL.md §4.H, §6).

use crate::AppContext;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};

fn viewport_id(params: &Value) -> Result<String> {
    params
        .get("viewport_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("INVALID_PARAMS: missing viewport_id"))
}

pub async fn start(params: Value, ctx: &AppContext) -> Result<Value> {
    let viewport = viewport_id(&params)?;
    let fps = params.get("fps").and_then(Value::as_u64).unwrap_or(10) as u32;
    let quality = params.get("quality").and_then(Value::as_u64).map(|q| q as u32);
    let started = ctx
        .video
        .start_stream(&ctx.browser, &viewport, fps, quality)
        .await?;
    Ok(json!({
        "viewport_id": viewport,
        "joined_existing": started.joined_existing,
    }))
}

pub async fn stop(params: Value, ctx: &AppContext) -> Result<Value> {
    let viewport = viewport_id(&params)?;
    ctx.video.stop_stream(&ctx.browser, &viewport).await;
    Ok(json!({ "viewport_id": viewport, "stopped": true }))
}

/// Pass-through from the child process — the daemon does not keep its own
/// idea of "all streams the browser knows about", only of the ones it has
/// an active relay for (`video.stats` covers that local view).
pub async fn list(_params: Value, ctx: &AppContext) -> Result<Value> {
    Ok(ctx.browser.call("listStreams", None, None).await?)
}

pub async fn stats(_params: Value, ctx: &AppContext) -> Result<Value> {
    Ok(json!(ctx.video.stats()))
}
