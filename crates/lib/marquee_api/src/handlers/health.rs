//! Reachability endpoint.

use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::models::HealthResponse;

/// `GET /health`: answers as long as the process is up; `dbConnected`
/// reports the store separately.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_connected = state.store.ping().await.is_ok();
    Json(HealthResponse {
        status: if db_connected { "ok" } else { "degraded" },
        version: crate::version(),
        db_connected,
    })
}
