// rest/mod.rs — the daemon's HTTP surface: a health check plus the MJPEG
// relay. The JSON-RPC surface lives entirely on the WebSocket side in
// `ipc`; this server exists because `<img>`/`<video>` tags can't speak
// JSON-RPC.
//
// Endpoints:
//   GET /health
//   GET /video/frame/{viewport}
//   GET /video/stream/{viewport}?fps=N
//   GET /video/list
//   GET /video/stats

pub mod routes;

use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("127.0.0.1:{}", ctx.config.rest_port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/video/frame/{viewport}", get(routes::video::get_frame))
        .route("/video/stream/{viewport}", get(routes::video::get_stream))
        .route("/video/list", get(routes::video::list_streams))
        .route("/video/stats", get(routes::video::stats))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
