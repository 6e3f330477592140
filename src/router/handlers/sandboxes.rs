//! `/sandboxes` route handlers. Each is a thin translation from HTTP to a
//! `LifecycleManager` call; no business logic lives here.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::error::Result;
use crate::router::AppState;
use crate::types::{
    AccessResponse, CompleteRequest, CompleteResponse, CreateSandboxRequest, DestroyQuery,
    ErrorCallbackRequest, ErrorCallbackResponse, ExecRequest, ExecResponse, HeartbeatResponse,
    ListSandboxesQuery, ListSandboxesResponse, LogsQuery, LogsResponse, SandboxRecord, StopReason,
};

pub async fn create_sandbox(
    State(state): State<AppState>,
    Json(body): Json<CreateSandboxRequest>,
) -> Result<(StatusCode, Json<SandboxRecord>)> {
    let record = state.manager.create(body.user_id, body.config).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    Query(query): Query<ListSandboxesQuery>,
) -> Result<Json<ListSandboxesResponse>> {
    let sandboxes = state.manager.list(query.user_id).await?;
    let total = sandboxes.len();
    Ok(Json(ListSandboxesResponse { sandboxes, total }))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<SandboxRecord>> {
    let record = state.manager.get(&sandbox_id).await?;
    Ok(Json(record))
}

pub async fn exec_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Json(body): Json<ExecRequest>,
) -> Result<Json<ExecResponse>> {
    let outcome = state
        .manager
        .exec(&sandbox_id, &body.command, &body.user, body.timeout, body.cwd.as_deref())
        .await?;

    Ok(Json(ExecResponse {
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
    }))
}

pub async fn generate_access(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<AccessResponse>> {
    let grant = state.manager.generate_access(&sandbox_id).await?;
    let ssh_command = format!("ssh {}@{} -p {}", grant.username, grant.host, grant.port);

    Ok(Json(AccessResponse {
        private_key: grant.private_key_pem,
        username: grant.username,
        host: grant.host,
        port: grant.port,
        ssh_command,
    }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<HeartbeatResponse>> {
    let acknowledged = state.manager.heartbeat(&sandbox_id).await?;
    Ok(Json(HeartbeatResponse { acknowledged, sandbox_id }))
}

pub async fn complete_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Json(_body): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>> {
    state.manager.destroy(&sandbox_id, true, StopReason::GracefulShutdown).await?;
    Ok(Json(CompleteResponse {
        status: "shutting_down",
        sandbox_id,
    }))
}

pub async fn error_callback(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Json(body): Json<ErrorCallbackRequest>,
) -> Result<Json<ErrorCallbackResponse>> {
    tracing::warn!(sandbox_id = %sandbox_id, error = %body.error, "agent reported error");
    state.manager.destroy(&sandbox_id, true, StopReason::Error).await?;
    Ok(Json(ErrorCallbackResponse {
        status: "shutting_down".to_string(),
        sandbox_id,
        error_received: true,
    }))
}

pub async fn destroy_sandbox(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Query(query): Query<DestroyQuery>,
) -> Result<StatusCode> {
    state
        .manager
        .destroy(&sandbox_id, query.graceful, StopReason::UserRequested)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_logs(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>> {
    let record = state.manager.get(&sandbox_id).await?;
    let container_id = record
        .container_id
        .as_deref()
        .ok_or_else(|| crate::error::DaemonError::validation("sandbox has no container".to_string()))?;

    let tail = query.tail.unwrap_or_else(|| "100".to_string());
    let (stdout, stderr) = state.driver.logs(container_id, &tail).await?;
    let lines = stdout.lines().count() + stderr.lines().count();

    Ok(Json(LogsResponse { stdout, stderr, lines }))
}

pub async fn get_stats(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<crate::docker::SandboxStats>> {
    let record = state.manager.get(&sandbox_id).await?;
    let container_id = record
        .container_id
        .as_deref()
        .ok_or_else(|| crate::error::DaemonError::validation("sandbox has no container".to_string()))?;

    let stats = state.driver.stats(container_id).await?;
    Ok(Json(stats))
}
