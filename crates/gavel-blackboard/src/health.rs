use crate::client::Blackboard;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Build the `/healthz` router every Gavel process serves.
///
/// Healthy iff the store answers a ping within 2 seconds.
pub fn health_router(blackboard: Arc<dyn Blackboard>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(blackboard)
}

async fn healthz(State(blackboard): State<Arc<dyn Blackboard>>) -> impl IntoResponse {
    match tokio::time::timeout(PING_TIMEOUT, blackboard.ping()).await {
        Ok(Ok(())) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy" })),
        ),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy", "error": e.to_string() })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy", "error": "store ping timed out" })),
        ),
    }
}
