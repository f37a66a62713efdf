//! Optional HTTP inspection server.
//!
//! Exposes `/health` for liveness probes and `/endpoints` with a JSON dump
//! of the watched targets and their committed probe/source statuses.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::Importer;

pub async fn serve(
    listener: TcpListener,
    importer: Arc<Importer>,
    root: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/endpoints", get(endpoints))
        .with_state(importer);
    info!("inspection server ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { root.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn endpoints(State(importer): State<Arc<Importer>>) -> Json<serde_json::Value> {
    Json(importer.inspect().await)
}
