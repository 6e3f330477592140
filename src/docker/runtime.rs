//! `ContainerRuntime`: the trait the Lifecycle Manager, reconciler, and
//! readiness poll depend on, instead of the concrete `ContainerDriver`.
//! Lets tests substitute a fake runtime without a live Docker daemon, the
//! same seam the teacher's own `ProcessEnvironment` trait draws between
//! `DockerEnvironment` and its server-lifecycle callers.

use async_trait::async_trait;

use crate::error::Result;

use super::driver::{ContainerHandle, ExecOutcome, Inspection, RunConfig, SandboxStats};

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, config: RunConfig) -> Result<ContainerHandle>;
    async fn inspect(&self, id: &str) -> Result<Inspection>;
    async fn exec(&self, id: &str, argv: Vec<String>, user: &str) -> Result<ExecOutcome>;
    async fn probe_file_exists(&self, id: &str, path: &str) -> Result<bool>;
    async fn stop(&self, id: &str, grace_seconds: i64) -> Result<()>;
    async fn kill(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str, force: bool) -> Result<()>;
    async fn force_remove_best_effort(&self, id: &str);
    async fn logs(&self, id: &str, tail: &str) -> Result<(String, String)>;
    async fn stats(&self, id: &str) -> Result<SandboxStats>;
    async fn list_ids_with_label(&self, key: &str, value: &str) -> Result<Vec<String>>;
    async fn close(&self);
}
