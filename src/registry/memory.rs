//! In-memory registry backend: a mapping from `sandbox_id` to record,
//! serialized by a single mutex around mutations. All state is lost on
//! restart; suitable for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::registry::SandboxStore;
use crate::types::{SandboxRecord, SandboxStatus, StopReason};

#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, SandboxRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SandboxStore for InMemoryStore {
    async fn save(&self, record: &SandboxRecord) -> Result<()> {
        self.records
            .lock()
            .insert(record.sandbox_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn list(&self, user_id: Option<Uuid>) -> Result<Vec<SandboxRecord>> {
        let mut records: Vec<SandboxRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.lock().remove(id).is_some())
    }

    async fn update_status(&self, id: &str, status: SandboxStatus) -> Result<bool> {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(record) => {
                record.transition(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_heartbeat(&self, id: &str) -> Result<bool> {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(record) => {
                record.last_heartbeat_at = Some(Utc::now());
                record.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_stopped(&self, id: &str, reason: StopReason) -> Result<bool> {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(record) => {
                record.stop_reason = Some(reason);
                record.transition(SandboxStatus::Stopped);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reconcile(&self, live_container_ids: &[String]) -> Result<Vec<String>> {
        let mut records = self.records.lock();
        let mut reconciled = Vec::new();
        for record in records.values_mut() {
            if record.status.is_live()
                && record
                    .container_id
                    .as_ref()
                    .map_or(true, |id| !live_container_ids.contains(id))
            {
                record.stop_reason = Some(StopReason::GracefulShutdown);
                record.transition(SandboxStatus::Stopped);
                reconciled.push(record.sandbox_id.clone());
            }
        }
        Ok(reconciled)
    }

    async fn expire_stale(&self) -> Result<Vec<String>> {
        let mut records = self.records.lock();
        let now = Utc::now();
        let mut expired = Vec::new();
        for record in records.values_mut() {
            if !record.status.is_terminal() && record.expires_at < now {
                record.stop_reason = Some(StopReason::Expired);
                record.transition(SandboxStatus::Expired);
                expired.push(record.sandbox_id.clone());
            }
        }
        Ok(expired)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as Json;

    fn new_record(user_id: Uuid, ttl: i64) -> SandboxRecord {
        SandboxRecord::new(user_id, Json::Null, ttl)
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = InMemoryStore::new();
        let record = new_record(Uuid::new_v4(), 7200);
        let id = record.sandbox_id.clone();

        store.save(&record).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.sandbox_id, record.sandbox_id);
        assert_eq!(loaded.user_id, record.user_id);
    }

    #[tokio::test]
    async fn list_filters_by_user() {
        let store = InMemoryStore::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        store.save(&new_record(user_a, 7200)).await.unwrap();
        store.save(&new_record(user_b, 7200)).await.unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store.list(Some(user_a)).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].user_id, user_a);
    }

    #[tokio::test]
    async fn update_status_to_stopped_sets_stopped_at() {
        let store = InMemoryStore::new();
        let record = new_record(Uuid::new_v4(), 7200);
        let id = record.sandbox_id.clone();
        store.save(&record).await.unwrap();

        assert!(store
            .update_status(&id, SandboxStatus::Stopped)
            .await
            .unwrap());

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Stopped);
        assert!(loaded.stopped_at.is_some());
    }

    #[tokio::test]
    async fn update_status_missing_record_returns_false() {
        let store = InMemoryStore::new();
        assert!(!store
            .update_status("sbx-000000000000", SandboxStatus::Stopped)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn heartbeat_does_not_change_status() {
        let store = InMemoryStore::new();
        let mut record = new_record(Uuid::new_v4(), 7200);
        record.status = SandboxStatus::Running;
        let id = record.sandbox_id.clone();
        store.save(&record).await.unwrap();

        assert!(store.update_heartbeat(&id).await.unwrap());
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Running);
        assert!(loaded.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn mark_stopped_sets_reason_and_terminal_status() {
        let store = InMemoryStore::new();
        let record = new_record(Uuid::new_v4(), 7200);
        let id = record.sandbox_id.clone();
        store.save(&record).await.unwrap();

        assert!(store
            .mark_stopped(&id, StopReason::UserRequested)
            .await
            .unwrap());

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Stopped);
        assert_eq!(loaded.stop_reason, Some(StopReason::UserRequested));
    }

    #[tokio::test]
    async fn reconcile_stops_records_missing_from_live_set() {
        let store = InMemoryStore::new();
        let mut record = new_record(Uuid::new_v4(), 7200);
        record.status = SandboxStatus::Ready;
        record.container_id = Some("abc123".to_string());
        let id = record.sandbox_id.clone();
        store.save(&record).await.unwrap();

        let reconciled = store.reconcile(&[]).await.unwrap();
        assert_eq!(reconciled, vec![id.clone()]);

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Stopped);
        assert_eq!(loaded.stop_reason, Some(StopReason::GracefulShutdown));
    }

    #[tokio::test]
    async fn reconcile_leaves_live_containers_alone() {
        let store = InMemoryStore::new();
        let mut record = new_record(Uuid::new_v4(), 7200);
        record.status = SandboxStatus::Running;
        record.container_id = Some("abc123".to_string());
        let id = record.sandbox_id.clone();
        store.save(&record).await.unwrap();

        let reconciled = store
            .reconcile(&["abc123".to_string()])
            .await
            .unwrap();
        assert!(reconciled.is_empty());

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn expire_stale_marks_expired_records() {
        let store = InMemoryStore::new();
        let mut record = new_record(Uuid::new_v4(), 7200);
        record.status = SandboxStatus::Running;
        record.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let id = record.sandbox_id.clone();
        store.save(&record).await.unwrap();

        let expired = store.expire_stale().await.unwrap();
        assert_eq!(expired, vec![id.clone()]);

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Expired);
        assert_eq!(loaded.stop_reason, Some(StopReason::Expired));
    }

    #[tokio::test]
    async fn terminal_records_never_leave_terminal() {
        let store = InMemoryStore::new();
        let mut record = new_record(Uuid::new_v4(), 7200);
        record.transition(SandboxStatus::Stopped);
        let id = record.sandbox_id.clone();
        store.save(&record).await.unwrap();

        // expire_stale and reconcile must not touch already-terminal records.
        store.expire_stale().await.unwrap();
        store.reconcile(&[]).await.unwrap();

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SandboxStatus::Stopped);
    }
}
