//! The Registry (Store): persists sandbox records behind a single
//! abstract interface, with pluggable in-memory and relational backends.
//! The Lifecycle Manager depends only on `SandboxStore`; it never matches
//! on the concrete backend.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::Result;
use crate::types::{SandboxRecord, SandboxStatus, StopReason};

#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Upsert by `sandbox_id` — used for initial insert and full-record updates.
    async fn save(&self, record: &SandboxRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SandboxRecord>>;

    /// Full scan, optional filter, ordered by `created_at` desc.
    async fn list(&self, user_id: Option<Uuid>) -> Result<Vec<SandboxRecord>>;

    /// Point delete; administrative paths only.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Narrow update; also sets `stopped_at=now()` when the new status is terminal.
    async fn update_status(&self, id: &str, status: SandboxStatus) -> Result<bool>;

    /// Sets `last_heartbeat_at=now()`. Never changes status.
    async fn update_heartbeat(&self, id: &str) -> Result<bool>;

    /// Sets status `stopped`, `stopped_at=now()`, `stop_reason=reason`.
    async fn mark_stopped(&self, id: &str, reason: StopReason) -> Result<bool>;

    /// For every non-terminal `starting`/`ready`/`running` record whose
    /// `container_id` is not in `live_container_ids`, transitions it to
    /// `stopped` with `stop_reason=graceful_shutdown`.
    async fn reconcile(&self, live_container_ids: &[String]) -> Result<Vec<String>>;

    /// Selects non-terminal records where `expires_at < now()`, updates
    /// them to `expired`, and returns their ids.
    async fn expire_stale(&self) -> Result<Vec<String>>;

    async fn close(&self) -> Result<()>;
}

/// Constructs the configured backend. The Manager is handed only the
/// trait object from here on.
pub async fn create_store(settings: &Settings) -> Result<Arc<dyn SandboxStore>> {
    match settings.sandbox_store.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        "postgres" => {
            let url = settings
                .database_url
                .as_deref()
                .ok_or_else(|| crate::error::DaemonError::Internal(
                    "MATRX_DATABASE_URL is required for the postgres store".into(),
                ))?;
            let store = PostgresStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        other => Err(crate::error::DaemonError::Internal(format!(
            "unknown MATRX_SANDBOX_STORE {:?}",
            other
        ))),
    }
}
