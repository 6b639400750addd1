//! Read-only HTTP status API.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /sandboxes` - Snapshot of every tracked sandbox, including
//!   `lastActivity` for external idle reapers
//! - `GET /pool/metrics` - Warm pool metrics, 404 when no pool runs

use crate::server::Daemon;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP router.
pub fn build_router(daemon: Daemon) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/sandboxes", get(sandboxes_handler))
        .route("/pool/metrics", get(pool_metrics_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(daemon)
}

async fn health_handler(State(daemon): State<Daemon>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "berth-daemon",
        "backend": daemon.provider().backend_name(),
        "pool": daemon.pool().is_some_and(|p| p.is_running()),
    }))
}

async fn sandboxes_handler(State(daemon): State<Daemon>) -> impl IntoResponse {
    Json(daemon.provider().list().await)
}

async fn pool_metrics_handler(State(daemon): State<Daemon>) -> Response {
    match daemon.pool() {
        Some(pool) => Json(pool.metrics().await).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "warm pool not enabled" })),
        )
            .into_response(),
    }
}

/// Start the HTTP server.
///
/// Runs until `shutdown` resolves.
pub async fn serve(
    daemon: Daemon,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(daemon);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
