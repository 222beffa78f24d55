//! `browser.*` RPC handlers — thin wrappers over `BrowserManager` exposing
//! process lifecycle control to WebSocket clients (SPEC_FULL.md §4.A, §6).

use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};

pub async fn start(_params: Value, ctx: &AppContext) -> Result<Value> {
    ctx.browser.start().await?;
    Ok(json!({ "state": format!("{:?}", ctx.browser.state().await) }))
}

pub async fn stop(_params: Value, ctx: &AppContext) -> Result<Value> {
    ctx.browser.stop().await?;
    Ok(json!({ "state": format!("{:?}", ctx.browser.state().await) }))
}

pub async fn restart(_params: Value, ctx: &AppContext) -> Result<Value> {
    ctx.browser.restart().await?;
    Ok(json!({ "state": format!("{:?}", ctx.browser.state().await) }))
}

pub async fn state(_params: Value, ctx: &AppContext) -> Result<Value> {
    Ok(json!({ "state": format!("{:?}", ctx.browser.state().await) }))
}
