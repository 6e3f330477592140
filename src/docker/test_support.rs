//! `FakeDriver`: an in-memory `ContainerRuntime` test double, standing in
//! for a live Docker daemon in unit tests. Compiled for test builds only.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{DaemonError, Result};

use super::driver::{ContainerHandle, ExecOutcome, Inspection, RunConfig, RuntimeState, SandboxStats};
use super::runtime::ContainerRuntime;

struct Inner {
    state: RuntimeState,
    ssh_port: Option<u16>,
    probe_result: bool,
    fail_run: bool,
    fail_inspect: bool,
    fail_inspect_not_found: bool,
    fail_inspect_from_call: Option<u32>,
    inspect_calls: u32,
    stop_not_found: bool,
    remove_not_found: bool,
    exec_calls: Vec<(String, Vec<String>, String)>,
    kill_calls: Vec<String>,
    remove_calls: Vec<String>,
    force_remove_calls: Vec<String>,
    next_container_id: String,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: RuntimeState::Running,
            ssh_port: Some(2222),
            probe_result: true,
            fail_run: false,
            fail_inspect: false,
            fail_inspect_not_found: false,
            fail_inspect_from_call: None,
            inspect_calls: 0,
            stop_not_found: false,
            remove_not_found: false,
            exec_calls: Vec::new(),
            kill_calls: Vec::new(),
            remove_calls: Vec::new(),
            force_remove_calls: Vec::new(),
            next_container_id: "fake-container".to_string(),
        }
    }
}

pub struct FakeDriver {
    inner: Mutex<Inner>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn set_state(&self, state: RuntimeState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn set_running(&self) {
        self.set_state(RuntimeState::Running);
    }

    pub fn set_ssh_port(&self, port: Option<u16>) {
        self.inner.lock().unwrap().ssh_port = port;
    }

    pub fn set_probe_result(&self, ready: bool) {
        self.inner.lock().unwrap().probe_result = ready;
    }

    pub fn fail_run(&self) {
        self.inner.lock().unwrap().fail_run = true;
    }

    pub fn fail_inspect(&self) {
        self.inner.lock().unwrap().fail_inspect = true;
    }

    pub fn fail_inspect_with_not_found(&self) {
        self.inner.lock().unwrap().fail_inspect_not_found = true;
    }

    /// Fails every `inspect` call from the `n`th onward (1-indexed), letting
    /// an earlier call (e.g. the post-run port read-back) succeed before a
    /// later one (e.g. the readiness poll) starts erroring.
    pub fn fail_inspect_from_call(&self, n: u32) {
        self.inner.lock().unwrap().fail_inspect_from_call = Some(n);
    }

    pub fn fail_stop_with_not_found(&self) {
        self.inner.lock().unwrap().stop_not_found = true;
    }

    pub fn fail_remove_with_not_found(&self) {
        self.inner.lock().unwrap().remove_not_found = true;
    }

    pub fn exec_calls(&self) -> Vec<(String, Vec<String>, String)> {
        self.inner.lock().unwrap().exec_calls.clone()
    }

    pub fn kill_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().kill_calls.clone()
    }

    pub fn remove_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().remove_calls.clone()
    }

    pub fn force_remove_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().force_remove_calls.clone()
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeDriver {
    async fn run(&self, _config: RunConfig) -> Result<ContainerHandle> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_run {
            return Err(DaemonError::runtime("fake container run failed"));
        }
        Ok(ContainerHandle {
            id: inner.next_container_id.clone(),
        })
    }

    async fn inspect(&self, _id: &str) -> Result<Inspection> {
        let mut inner = self.inner.lock().unwrap();
        inner.inspect_calls += 1;
        if inner.fail_inspect_not_found {
            return Err(DaemonError::not_found("fake container not found"));
        }
        if inner.fail_inspect {
            return Err(DaemonError::runtime("fake container inspect failed"));
        }
        if let Some(from) = inner.fail_inspect_from_call {
            if inner.inspect_calls >= from {
                return Err(DaemonError::runtime("fake container inspect failed"));
            }
        }
        Ok(Inspection {
            state: inner.state,
            ssh_port: inner.ssh_port,
        })
    }

    async fn exec(&self, id: &str, argv: Vec<String>, user: &str) -> Result<ExecOutcome> {
        self.inner
            .lock()
            .unwrap()
            .exec_calls
            .push((id.to_string(), argv, user.to_string()));
        Ok(ExecOutcome {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn probe_file_exists(&self, _id: &str, _path: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().probe_result)
    }

    async fn stop(&self, _id: &str, _grace_seconds: i64) -> Result<()> {
        if self.inner.lock().unwrap().stop_not_found {
            return Err(DaemonError::not_found("fake container already gone"));
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().kill_calls.push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        self.inner.lock().unwrap().remove_calls.push(id.to_string());
        if self.inner.lock().unwrap().remove_not_found {
            return Err(DaemonError::not_found("fake container already gone"));
        }
        Ok(())
    }

    async fn force_remove_best_effort(&self, id: &str) {
        self.inner.lock().unwrap().force_remove_calls.push(id.to_string());
    }

    async fn logs(&self, _id: &str, _tail: &str) -> Result<(String, String)> {
        Ok((String::new(), String::new()))
    }

    async fn stats(&self, _id: &str) -> Result<SandboxStats> {
        Ok(SandboxStats {
            cpu_percent: 0.0,
            memory_usage_bytes: 0,
            memory_limit_bytes: 1,
            memory_percent: 0.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            pids: 0,
        })
    }

    async fn list_ids_with_label(&self, _key: &str, _value: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn close(&self) {}
}
