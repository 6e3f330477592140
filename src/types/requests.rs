//! HTTP request and response bodies for the `/sandboxes` surface.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub config: Option<Json>,
}

#[derive(Debug, Deserialize)]
pub struct ListSandboxesQuery {
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListSandboxesResponse {
    pub sandboxes: Vec<crate::types::SandboxRecord>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default = "default_exec_user")]
    pub user: String,
    #[serde(default = "default_exec_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub cwd: Option<String>,
}

fn default_exec_user() -> String {
    "agent".to_string()
}

fn default_exec_timeout() -> u64 {
    30
}

#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
pub struct AccessResponse {
    pub private_key: String,
    pub username: String,
    pub host: String,
    pub port: u16,
    pub ssh_command: String,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    pub sandbox_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub result: Option<Json>,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub status: &'static str,
    pub sandbox_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ErrorCallbackRequest {
    pub error: String,
    #[serde(default)]
    pub details: Option<Json>,
}

#[derive(Debug, Serialize)]
pub struct ErrorCallbackResponse {
    pub status: String,
    pub sandbox_id: String,
    pub error_received: bool,
}

#[derive(Debug, Deserialize)]
pub struct DestroyQuery {
    #[serde(default = "default_graceful")]
    pub graceful: bool,
}

fn default_graceful() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub stdout: String,
    pub stderr: String,
    pub lines: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sandboxes: usize,
    pub uptime_seconds: u64,
}
