//! Durable registry backend: a single `sandbox_instances` table behind a
//! bounded connection pool. Statement caching is disabled so the pool
//! tolerates sitting behind a transaction-mode connection pooler
//! (PgBouncer/Supavisor) in front of Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DaemonError, Result};
use crate::registry::SandboxStore;
use crate::types::{SandboxRecord, SandboxStatus, StopReason};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| DaemonError::Internal(format!("invalid DATABASE_URL: {e}")))?
            .statement_cache_capacity(0);

        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| DaemonError::Internal(format!("failed to connect to Postgres: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DaemonError::Internal(format!("failed to run migrations: {e}")))?;

        Ok(Self { pool })
    }
}

#[derive(FromRow)]
struct SandboxRow {
    sandbox_id: String,
    user_id: Uuid,
    status: String,
    container_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    ttl_seconds: i64,
    stop_reason: Option<String>,
    hot_path: String,
    cold_path: String,
    ssh_port: Option<i32>,
    config: serde_json::Value,
}

impl TryFrom<SandboxRow> for SandboxRecord {
    type Error = DaemonError;

    fn try_from(row: SandboxRow) -> std::result::Result<Self, Self::Error> {
        let status = parse_status(&row.status)?;
        let stop_reason = row.stop_reason.as_deref().map(parse_stop_reason).transpose()?;

        Ok(SandboxRecord {
            sandbox_id: row.sandbox_id,
            user_id: row.user_id,
            status,
            container_id: row.container_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            stopped_at: row.stopped_at,
            last_heartbeat_at: row.last_heartbeat_at,
            expires_at: row.expires_at,
            ttl_seconds: row.ttl_seconds,
            stop_reason,
            hot_path: row.hot_path,
            cold_path: row.cold_path,
            ssh_port: row.ssh_port.map(|p| p as u16),
            config: row.config,
        })
    }
}

fn parse_status(s: &str) -> Result<SandboxStatus> {
    Ok(match s {
        "creating" => SandboxStatus::Creating,
        "starting" => SandboxStatus::Starting,
        "ready" => SandboxStatus::Ready,
        "running" => SandboxStatus::Running,
        "shutting_down" => SandboxStatus::ShuttingDown,
        "stopped" => SandboxStatus::Stopped,
        "failed" => SandboxStatus::Failed,
        "expired" => SandboxStatus::Expired,
        other => return Err(DaemonError::Internal(format!("unknown status in store: {other}"))),
    })
}

fn parse_stop_reason(s: &str) -> Result<StopReason> {
    Ok(match s {
        "user_requested" => StopReason::UserRequested,
        "graceful_shutdown" => StopReason::GracefulShutdown,
        "error" => StopReason::Error,
        "expired" => StopReason::Expired,
        "admin" => StopReason::Admin,
        other => return Err(DaemonError::Internal(format!("unknown stop_reason in store: {other}"))),
    })
}

#[async_trait]
impl SandboxStore for PostgresStore {
    async fn save(&self, record: &SandboxRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandbox_instances
                (sandbox_id, user_id, status, container_id, created_at, updated_at,
                 stopped_at, last_heartbeat_at, ttl_seconds, stop_reason, hot_path,
                 cold_path, ssh_port, config)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (sandbox_id) DO UPDATE SET
                status = EXCLUDED.status,
                container_id = EXCLUDED.container_id,
                updated_at = EXCLUDED.updated_at,
                stopped_at = EXCLUDED.stopped_at,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                stop_reason = EXCLUDED.stop_reason,
                ssh_port = EXCLUDED.ssh_port,
                config = EXCLUDED.config
            "#,
        )
        .bind(&record.sandbox_id)
        .bind(record.user_id)
        .bind(record.status.as_str())
        .bind(&record.container_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.stopped_at)
        .bind(record.last_heartbeat_at)
        .bind(record.ttl_seconds)
        .bind(record.stop_reason.map(|r| r.to_string()))
        .bind(&record.hot_path)
        .bind(&record.cold_path)
        .bind(record.ssh_port.map(|p| p as i32))
        .bind(&record.config)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxRecord>> {
        let row = sqlx::query_as::<_, SandboxRow>(
            "SELECT * FROM sandbox_instances WHERE sandbox_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SandboxRecord::try_from).transpose()
    }

    async fn list(&self, user_id: Option<Uuid>) -> Result<Vec<SandboxRecord>> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query_as::<_, SandboxRow>(
                    "SELECT * FROM sandbox_instances WHERE user_id = $1 ORDER BY created_at DESC",
                )
                .bind(uid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SandboxRow>(
                    "SELECT * FROM sandbox_instances ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(SandboxRecord::try_from).collect()
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sandbox_instances WHERE sandbox_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(&self, id: &str, status: SandboxStatus) -> Result<bool> {
        let stopped_at = status.is_terminal().then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE sandbox_instances
            SET status = $2, updated_at = now(), stopped_at = COALESCE(stopped_at, $3)
            WHERE sandbox_id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(stopped_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_heartbeat(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sandbox_instances SET last_heartbeat_at = now(), updated_at = now() WHERE sandbox_id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_stopped(&self, id: &str, reason: StopReason) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandbox_instances
            SET status = 'stopped', stopped_at = now(), updated_at = now(), stop_reason = $2
            WHERE sandbox_id = $1
            "#,
        )
        .bind(id)
        .bind(reason.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reconcile(&self, live_container_ids: &[String]) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE sandbox_instances
            SET status = 'stopped', stopped_at = now(), updated_at = now(), stop_reason = 'graceful_shutdown'
            WHERE status IN ('starting', 'ready', 'running')
              AND (container_id IS NULL OR NOT (container_id = ANY($1)))
            RETURNING sandbox_id
            "#,
        )
        .bind(live_container_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn expire_stale(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE sandbox_instances
            SET status = 'expired', stopped_at = now(), updated_at = now(), stop_reason = 'expired'
            WHERE status NOT IN ('stopped', 'failed', 'expired')
              AND expires_at < now()
            RETURNING sandbox_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
