//! The Lifecycle Manager: the six operations that own the invariants
//! relating a registry record to its container. Depends only on the
//! `SandboxStore` trait object, never a concrete backend.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::{error, warn};
use uuid::Uuid;

use crate::access;
use crate::config::Settings;
use crate::docker::{ContainerRuntime, ExecOutcome as DriverExecOutcome, RunConfig, RuntimeState};
use crate::error::{DaemonError, Result};
use crate::lifecycle::lock::KeyedLocker;
use crate::lifecycle::readiness::{wait_until_ready, ReadinessOutcome};
use crate::registry::SandboxStore;
use crate::types::{SandboxRecord, SandboxStatus, StopReason};

const MAX_COMMAND_LENGTH: usize = 10_000;
const MIN_EXEC_TIMEOUT_SECS: u64 = 1;
const MAX_EXEC_TIMEOUT_SECS: u64 = 600;
const SANDBOX_LABEL_KEY: &str = "sandbox_id";
const ACCESS_KEY_COMMENT: &str = "user-access";

pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

pub struct AccessGrant {
    pub private_key_pem: String,
    pub username: String,
    pub host: String,
    pub port: u16,
}

pub struct LifecycleManager {
    store: Arc<dyn SandboxStore>,
    driver: Arc<dyn ContainerRuntime>,
    settings: Arc<Settings>,
    locks: KeyedLocker,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn SandboxStore>, driver: Arc<dyn ContainerRuntime>, settings: Arc<Settings>) -> Self {
        Self {
            store,
            driver,
            settings,
            locks: KeyedLocker::new(),
        }
    }

    pub async fn create(&self, user_id: Uuid, config: Option<Json>) -> Result<SandboxRecord> {
        let config = config.unwrap_or(Json::Null);
        let mut record = SandboxRecord::new(user_id, config, self.settings.max_session_duration_seconds as i64);
        let sandbox_id = record.sandbox_id.clone();

        let _guard = self.locks.acquire(&sandbox_id).await;

        self.store.save(&record).await?;

        let run_config = self.build_run_config(&record);

        let handle = match self.driver.run(run_config).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(sandbox_id = %sandbox_id, error = %e, "container create failed");
                record.transition(SandboxStatus::Failed);
                self.store.save(&record).await?;
                return Err(e);
            }
        };

        record.container_id = Some(handle.id.clone());

        match self.driver.inspect(&handle.id).await {
            Ok(inspection) => {
                record.ssh_port = inspection.ssh_port;
                record.transition(SandboxStatus::Starting);
                self.store.save(&record).await?;
            }
            Err(e) => {
                error!(sandbox_id = %sandbox_id, error = %e, "failed to read back container port");
                self.driver.force_remove_best_effort(&handle.id).await;
                record.transition(SandboxStatus::Failed);
                self.store.save(&record).await?;
                return Err(e);
            }
        }

        match wait_until_ready(&self.driver, &handle.id).await {
            Ok(ReadinessOutcome::Ready) => {
                record.transition(SandboxStatus::Ready);
            }
            Ok(ReadinessOutcome::Failed) => {
                warn!(sandbox_id = %sandbox_id, "sandbox did not become ready in time");
                self.driver.force_remove_best_effort(&handle.id).await;
                record.transition(SandboxStatus::Failed);
            }
            Err(e) => {
                error!(sandbox_id = %sandbox_id, error = %e, "readiness poll errored");
                self.driver.force_remove_best_effort(&handle.id).await;
                record.transition(SandboxStatus::Failed);
            }
        }

        self.store.save(&record).await?;
        Ok(record)
    }

    fn build_run_config(&self, record: &SandboxRecord) -> RunConfig {
        let mut env = HashMap::new();
        env.insert("SANDBOX_ID".to_string(), record.sandbox_id.clone());
        env.insert("USER_ID".to_string(), record.user_id.to_string());
        env.insert("S3_BUCKET".to_string(), self.settings.s3_bucket.clone());
        env.insert("S3_REGION".to_string(), self.settings.s3_region.clone());
        env.insert("HOT_PATH".to_string(), record.hot_path.clone());
        env.insert("COLD_PATH".to_string(), record.cold_path.clone());
        env.insert(
            "SHUTDOWN_TIMEOUT_SECONDS".to_string(),
            self.settings.shutdown_timeout_seconds.to_string(),
        );

        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL_KEY.to_string(), record.sandbox_id.clone());
        labels.insert("user_id".to_string(), record.user_id.to_string());
        labels.insert("created_at".to_string(), record.created_at.to_rfc3339());
        labels.insert(
            crate::reconcile::MANAGED_BY_LABEL_KEY.to_string(),
            crate::reconcile::MANAGED_BY_LABEL_VALUE.to_string(),
        );

        RunConfig {
            sandbox_id: record.sandbox_id.clone(),
            user_id: record.user_id,
            image: self.settings.sandbox_image.clone(),
            env,
            cpu_limit: self.settings.container_cpu_limit,
            memory_limit: self.settings.container_memory_limit.clone(),
            network: self.settings.docker_network.clone(),
            labels,
        }
    }

    pub async fn get(&self, sandbox_id: &str) -> Result<SandboxRecord> {
        self.store
            .get(sandbox_id)
            .await?
            .ok_or_else(|| DaemonError::not_found(format!("sandbox {sandbox_id} not found")))
    }

    pub async fn list(&self, user_id: Option<Uuid>) -> Result<Vec<SandboxRecord>> {
        self.store.list(user_id).await
    }

    pub async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        user: &str,
        timeout_secs: u64,
        cwd: Option<&str>,
    ) -> Result<ExecResult> {
        if command.is_empty() || command.len() > MAX_COMMAND_LENGTH {
            return Err(DaemonError::validation(format!(
                "command must be non-empty and at most {MAX_COMMAND_LENGTH} characters"
            )));
        }
        if !(MIN_EXEC_TIMEOUT_SECS..=MAX_EXEC_TIMEOUT_SECS).contains(&timeout_secs) {
            return Err(DaemonError::validation(format!(
                "timeout must be between {MIN_EXEC_TIMEOUT_SECS} and {MAX_EXEC_TIMEOUT_SECS} seconds"
            )));
        }

        let record = self.get(sandbox_id).await?;
        let container_id = record
            .container_id
            .as_ref()
            .ok_or_else(|| DaemonError::validation("sandbox has no container".to_string()))?;

        let inspection = match self.driver.inspect(container_id).await {
            Ok(inspection) => inspection,
            Err(DaemonError::NotFound(_)) => {
                return Err(DaemonError::validation(format!(
                    "sandbox {sandbox_id} is not running"
                )))
            }
            Err(e) => return Err(e),
        };
        if inspection.state != RuntimeState::Running {
            return Err(DaemonError::validation(format!(
                "sandbox {sandbox_id} is not running"
            )));
        }

        let argv = shell_argv(command, cwd);
        let outcome: DriverExecOutcome = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            self.driver.exec(container_id, argv, user),
        )
        .await
        .map_err(|_| DaemonError::Runtime("exec timed out".to_string()))??;

        Ok(ExecResult {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        })
    }

    pub async fn heartbeat(&self, sandbox_id: &str) -> Result<bool> {
        let record = self.get(sandbox_id).await?;
        if record.status.is_terminal() {
            return Err(DaemonError::validation(format!(
                "sandbox {sandbox_id} is already in a terminal state"
            )));
        }
        self.store.update_heartbeat(sandbox_id).await
    }

    pub async fn destroy(&self, sandbox_id: &str, graceful: bool, reason: StopReason) -> Result<()> {
        let _guard = self.locks.acquire(sandbox_id).await;

        let mut record = self.get(sandbox_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        record.transition(SandboxStatus::ShuttingDown);
        self.store.save(&record).await?;

        if let Some(container_id) = record.container_id.clone() {
            let stop_result = if graceful {
                let grace = self.settings.shutdown_timeout_seconds as i64 + 10;
                self.driver.stop(&container_id, grace).await
            } else {
                self.driver.kill(&container_id).await
            };

            if let Err(e) = stop_result {
                if !matches!(e, DaemonError::NotFound(_)) {
                    error!(sandbox_id, error = %e, "failed to stop container during destroy");
                    record.transition(SandboxStatus::Failed);
                    self.store.save(&record).await?;
                    return Err(e);
                }
            }

            if let Err(e) = self.driver.remove(&container_id, true).await {
                if !matches!(e, DaemonError::NotFound(_)) {
                    error!(sandbox_id, error = %e, "failed to remove container during destroy");
                    record.transition(SandboxStatus::Failed);
                    self.store.save(&record).await?;
                    return Err(e);
                }
            }
        }

        self.store.mark_stopped(sandbox_id, reason).await?;
        Ok(())
    }

    /// Tears down the container behind an already-expired record. Used only
    /// by the expirer: `expire_stale` has already flipped the record to the
    /// terminal `expired` status in a single store statement, so `destroy`
    /// cannot be reused here — it would either no-op on a terminal record or,
    /// if that early-return were removed, transition a terminal record away
    /// from terminal, which invariant 2 forbids. This performs the same
    /// kill-then-remove sequence as a non-graceful `destroy` without
    /// touching status again.
    pub async fn reap_expired(&self, sandbox_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(sandbox_id).await;

        let record = self.get(sandbox_id).await?;
        let Some(container_id) = record.container_id else {
            return Ok(());
        };

        if let Err(e) = self.driver.kill(&container_id).await {
            if !matches!(e, DaemonError::NotFound(_)) {
                warn!(sandbox_id, error = %e, "failed to kill container while reaping expired sandbox");
            }
        }
        if let Err(e) = self.driver.remove(&container_id, true).await {
            if !matches!(e, DaemonError::NotFound(_)) {
                warn!(sandbox_id, error = %e, "failed to remove container while reaping expired sandbox");
            }
        }
        Ok(())
    }

    pub async fn generate_access(&self, sandbox_id: &str) -> Result<AccessGrant> {
        let _guard = self.locks.acquire(sandbox_id).await;

        let record = self.get(sandbox_id).await?;
        let container_id = record
            .container_id
            .ok_or_else(|| DaemonError::validation("sandbox has no container".to_string()))?;
        let ssh_port = record
            .ssh_port
            .ok_or_else(|| DaemonError::validation("sandbox has no assigned SSH port".to_string()))?;

        let keypair = access::generate(ACCESS_KEY_COMMENT);
        let injection_script = format!(
            "mkdir -p ~agent/.ssh && echo '{}' >> ~agent/.ssh/authorized_keys && chown -R agent:agent ~agent/.ssh && chmod 600 ~agent/.ssh/authorized_keys",
            keypair.public_key_line.replace('\'', "'\\''")
        );

        self.driver
            .exec(&container_id, vec!["sh".to_string(), "-c".to_string(), injection_script], "root")
            .await?;

        Ok(AccessGrant {
            private_key_pem: keypair.private_key_pem,
            username: "agent".to_string(),
            host: self.settings.host.clone(),
            port: ssh_port,
        })
    }
}

fn shell_argv(command: &str, cwd: Option<&str>) -> Vec<String> {
    match cwd {
        Some(dir) => vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cd {} && {}", shell_quote(dir), command),
        ],
        None => vec!["sh".to_string(), "-c".to_string(), command.to_string()],
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_argv_without_cwd_runs_command_directly() {
        let argv = shell_argv("echo hi", None);
        assert_eq!(argv, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn shell_argv_with_cwd_changes_directory_first() {
        let argv = shell_argv("ls", Some("/home/agent"));
        assert_eq!(argv, vec!["sh", "-c", "cd '/home/agent' && ls"]);
    }

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use crate::docker::test_support::FakeDriver;
    use crate::registry::InMemoryStore;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings {
            host: "127.0.0.1".to_string(),
            port: 8000,
            debug: false,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
            api_key: String::new(),
            api_key_header: "X-API-Key".to_string(),
            sandbox_image: "sandbox:test".to_string(),
            docker_network: "bridge".to_string(),
            container_cpu_limit: 1.0,
            container_memory_limit: "1g".to_string(),
            container_disk_limit: "1g".to_string(),
            s3_bucket: String::new(),
            s3_region: "us-east-1".to_string(),
            max_session_duration_seconds: 7200,
            shutdown_timeout_seconds: 5,
            healthcheck_interval_seconds: 30,
            max_command_length: MAX_COMMAND_LENGTH,
            command_timeout_seconds: 30,
            sandbox_store: "memory".to_string(),
            database_url: None,
        })
    }

    fn test_manager(driver: FakeDriver) -> (LifecycleManager, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let manager = LifecycleManager::new(store.clone(), Arc::new(driver), test_settings());
        (manager, store)
    }

    fn test_manager_with_driver(driver: FakeDriver) -> (LifecycleManager, Arc<InMemoryStore>, Arc<FakeDriver>) {
        let store = Arc::new(InMemoryStore::new());
        let driver = Arc::new(driver);
        let manager = LifecycleManager::new(store.clone(), driver.clone(), test_settings());
        (manager, store, driver)
    }

    #[tokio::test]
    async fn create_happy_path_reaches_ready_with_assigned_port() {
        let (manager, _store) = test_manager(FakeDriver::new());

        let record = manager.create(Uuid::new_v4(), None).await.unwrap();

        assert_eq!(record.status, SandboxStatus::Ready);
        assert!(record.container_id.is_some());
        assert_eq!(record.ssh_port, Some(2222));
    }

    #[tokio::test]
    async fn create_marks_failed_when_run_fails() {
        let driver = FakeDriver::new();
        driver.fail_run();
        let (manager, store) = test_manager(driver);

        let err = manager.create(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, DaemonError::Runtime(_)));

        let records = store.list(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SandboxStatus::Failed);
    }

    #[tokio::test]
    async fn create_marks_failed_when_container_exits_before_ready() {
        let driver = FakeDriver::new();
        driver.set_state(RuntimeState::Exited);
        let (manager, _store, driver) = test_manager_with_driver(driver);

        let record = manager.create(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(record.status, SandboxStatus::Failed);
        // A container that exits during the readiness poll must still be
        // force-removed so it doesn't leak past a terminal registry record.
        assert_eq!(driver.force_remove_calls(), vec!["fake-container".to_string()]);
    }

    #[tokio::test]
    async fn create_force_removes_container_when_readiness_poll_errors() {
        let driver = FakeDriver::new();
        // Succeed on the post-run port read-back (call 1), then fail every
        // inspect from the readiness poll's first call (call 2) onward.
        driver.fail_inspect_from_call(2);
        let (manager, _store, driver) = test_manager_with_driver(driver);

        let record = manager.create(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(record.status, SandboxStatus::Failed);
        assert_eq!(driver.force_remove_calls(), vec!["fake-container".to_string()]);
    }

    #[tokio::test]
    async fn exec_rejects_empty_and_oversized_commands() {
        let (manager, _store) = test_manager(FakeDriver::new());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();

        let too_long = "a".repeat(MAX_COMMAND_LENGTH + 1);
        let err = manager
            .exec(&created.sandbox_id, &too_long, "agent", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));

        let err = manager
            .exec(&created.sandbox_id, "", "agent", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[tokio::test]
    async fn exec_succeeds_against_a_running_container() {
        let (manager, _store) = test_manager(FakeDriver::new());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();

        let result = manager
            .exec(&created.sandbox_id, "echo hi", "agent", 5, None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exec_against_non_running_container_is_rejected() {
        // A container already exited on the host still has a registry
        // record with a container_id; exec must consult live state rather
        // than trust the stored status and refuse the command.
        let driver = FakeDriver::new();
        let store = Arc::new(InMemoryStore::new());
        let manager = LifecycleManager::new(store.clone(), Arc::new(FakeDriver::new()), test_settings());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(created.status, SandboxStatus::Ready);

        driver.set_state(RuntimeState::Exited);
        let manager_with_driver = LifecycleManager::new(store, Arc::new(driver), test_settings());
        let err = manager_with_driver
            .exec(&created.sandbox_id, "echo hi", "agent", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[tokio::test]
    async fn exec_against_removed_container_is_rejected_not_not_found() {
        // destroy() removes the container from the runtime entirely, so a
        // subsequent exec's inspect call comes back 404. That must surface
        // as the same "not running" validation error as the exited-container
        // case, not as a bare not-found.
        let driver = FakeDriver::new();
        let store = Arc::new(InMemoryStore::new());
        let manager = LifecycleManager::new(store.clone(), Arc::new(FakeDriver::new()), test_settings());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();

        driver.fail_inspect_with_not_found();
        let manager_with_driver = LifecycleManager::new(store, Arc::new(driver), test_settings());
        let err = manager_with_driver
            .exec(&created.sandbox_id, "echo hi", "agent", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[tokio::test]
    async fn heartbeat_on_terminal_record_is_rejected_without_mutating() {
        let (manager, store) = test_manager(FakeDriver::new());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();
        manager
            .destroy(&created.sandbox_id, true, StopReason::UserRequested)
            .await
            .unwrap();

        let err = manager.heartbeat(&created.sandbox_id).await.unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));

        let record = store.get(&created.sandbox_id).await.unwrap().unwrap();
        assert!(record.last_heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn heartbeat_on_live_record_succeeds() {
        let (manager, _store) = test_manager(FakeDriver::new());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();

        assert!(manager.heartbeat(&created.sandbox_id).await.unwrap());
        let record = manager.get(&created.sandbox_id).await.unwrap();
        assert!(record.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn destroy_is_idempotent_on_terminal_records() {
        let (manager, _store) = test_manager(FakeDriver::new());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();

        manager
            .destroy(&created.sandbox_id, true, StopReason::UserRequested)
            .await
            .unwrap();
        let stopped = manager.get(&created.sandbox_id).await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        assert_eq!(stopped.stop_reason, Some(StopReason::UserRequested));

        // Second destroy on an already-terminal record is a no-op, not an error.
        manager
            .destroy(&created.sandbox_id, true, StopReason::UserRequested)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn destroy_tolerates_container_already_gone() {
        let driver = FakeDriver::new();
        driver.fail_stop_with_not_found();
        driver.fail_remove_with_not_found();
        let (manager, _store) = test_manager(driver);
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();

        manager
            .destroy(&created.sandbox_id, true, StopReason::Expired)
            .await
            .unwrap();
        let stopped = manager.get(&created.sandbox_id).await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn reap_expired_tears_down_container_without_touching_terminal_status() {
        let driver = Arc::new(FakeDriver::new());
        let store = Arc::new(InMemoryStore::new());
        let manager = LifecycleManager::new(store.clone(), driver.clone(), test_settings());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();
        let container_id = created.container_id.clone().unwrap();

        // Mirror what the expirer's `expire_stale` store call already did:
        // flip the record to the terminal `expired` status before the
        // container is actually torn down.
        let mut expired = store.get(&created.sandbox_id).await.unwrap().unwrap();
        expired.status = SandboxStatus::Expired;
        expired.stop_reason = Some(StopReason::Expired);
        store.save(&expired).await.unwrap();

        manager.reap_expired(&created.sandbox_id).await.unwrap();

        assert_eq!(driver.kill_calls(), vec![container_id.clone()]);
        assert_eq!(driver.remove_calls(), vec![container_id]);

        let after = manager.get(&created.sandbox_id).await.unwrap();
        assert_eq!(after.status, SandboxStatus::Expired);
        assert_eq!(after.stop_reason, Some(StopReason::Expired));
    }

    #[tokio::test]
    async fn generate_access_injects_key_into_root_shell() {
        let (manager, _store) = test_manager(FakeDriver::new());
        let created = manager.create(Uuid::new_v4(), None).await.unwrap();

        let grant = manager.generate_access(&created.sandbox_id).await.unwrap();
        assert_eq!(grant.username, "agent");
        assert_eq!(grant.port, 2222);
        assert!(grant.private_key_pem.contains("PRIVATE KEY"));
    }
}
