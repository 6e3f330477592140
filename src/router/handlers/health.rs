use axum::extract::State;
use axum::Json;

use crate::router::AppState;
use crate::types::HealthResponse;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let active_sandboxes = state
        .manager
        .list(None)
        .await
        .map(|sandboxes| sandboxes.iter().filter(|s| s.status.is_live()).count())
        .unwrap_or(0);

    Json(HealthResponse {
        status: "ok",
        active_sandboxes,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
