//! The sandbox record: the single persistent entity the registry stores,
//! its status machine, and the stop-reason taxonomy.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

/// `creating -> starting -> ready -> running -> shutting_down -> {stopped, failed, expired}`.
/// `stopped`, `failed`, and `expired` are terminal: no operation may move a
/// record out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Starting,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
    Expired,
}

impl SandboxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Expired)
    }

    /// Statuses the reconciler treats as "should have a live container".
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
    GracefulShutdown,
    Error,
    Expired,
    Admin,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserRequested => "user_requested",
            Self::GracefulShutdown => "graceful_shutdown",
            Self::Error => "error",
            Self::Expired => "expired",
            Self::Admin => "admin",
        };
        write!(f, "{}", s)
    }
}

/// The single persistent entity. Keyed by `sandbox_id`, a string of the
/// form `sbx-<12 hex chars>` generated once at creation and stable for
/// the record's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub user_id: Uuid,
    pub status: SandboxStatus,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub stop_reason: Option<StopReason>,
    pub hot_path: String,
    pub cold_path: String,
    pub ssh_port: Option<u16>,
    pub config: Json,
}

pub const DEFAULT_TTL_SECONDS: i64 = 7200;
pub const DEFAULT_HOT_PATH: &str = "/home/agent";
pub const DEFAULT_COLD_PATH: &str = "/data/cold";

impl SandboxRecord {
    /// Builds a fresh `creating` record. `expires_at` is derived from
    /// `created_at + ttl_seconds` exactly once, here, per the invariant
    /// that it is recomputed only on insert.
    pub fn new(user_id: Uuid, config: Json, ttl_seconds: i64) -> Self {
        let now = Utc::now();
        Self {
            sandbox_id: generate_sandbox_id(),
            user_id,
            status: SandboxStatus::Creating,
            container_id: None,
            created_at: now,
            updated_at: now,
            stopped_at: None,
            last_heartbeat_at: None,
            expires_at: now + Duration::seconds(ttl_seconds),
            ttl_seconds,
            stop_reason: None,
            hot_path: DEFAULT_HOT_PATH.to_string(),
            cold_path: DEFAULT_COLD_PATH.to_string(),
            ssh_port: None,
            config,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn transition(&mut self, status: SandboxStatus) {
        self.status = status;
        self.touch();
        if status.is_terminal() {
            self.stopped_at.get_or_insert(self.updated_at);
        }
    }
}

fn generate_sandbox_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("sbx-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_ids_matching_contract() {
        let re_chars = "0123456789abcdef";
        for _ in 0..50 {
            let id = generate_sandbox_id();
            assert!(id.starts_with("sbx-"));
            let hex_part = &id[4..];
            assert_eq!(hex_part.len(), 12);
            assert!(hex_part.chars().all(|c| re_chars.contains(c)));
        }
    }

    #[test]
    fn new_record_has_consistent_expiry() {
        let record = SandboxRecord::new(Uuid::new_v4(), Json::Null, 100);
        assert_eq!(record.status, SandboxStatus::Creating);
        assert_eq!(
            (record.expires_at - record.created_at).num_seconds(),
            100
        );
        assert!(record.stopped_at.is_none());
        assert!(!record.status.is_terminal());
    }

    #[test]
    fn transition_to_terminal_sets_stopped_at() {
        let mut record = SandboxRecord::new(Uuid::new_v4(), Json::Null, 100);
        record.transition(SandboxStatus::Stopped);
        assert!(record.status.is_terminal());
        assert!(record.stopped_at.is_some());
    }

    #[test]
    fn terminal_statuses() {
        assert!(SandboxStatus::Stopped.is_terminal());
        assert!(SandboxStatus::Failed.is_terminal());
        assert!(SandboxStatus::Expired.is_terminal());
        assert!(!SandboxStatus::Ready.is_terminal());
        assert!(!SandboxStatus::Running.is_terminal());
        assert!(!SandboxStatus::Creating.is_terminal());
    }
}
