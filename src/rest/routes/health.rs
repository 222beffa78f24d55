use crate::observability::HealthStatus;
use crate::AppContext;
use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let uptime = ctx.started_at.elapsed().as_secs();
    let browser_ready = ctx.browser.is_ready().await;
    let browser_state = format!("{:?}", ctx.browser.state().await);
    let status = HealthStatus::ok(uptime, browser_ready);
    Json(json!({
        "status": status.status,
        "version": status.version,
        "uptime_secs": status.uptime_secs,
        "browser": { "state": browser_state, "ready": browser_ready },
        "video": ctx.video.stats(),
    }))
}
