//! Thin wrapper over the container runtime daemon (Docker, via `bollard`).
//!
//! The client is a singleton: constructed once and shared via `Arc` across
//! every call, avoiding per-request connection/FD churn. It is lazily
//! constructed by `ContainerDriver::connect` and explicitly released at
//! process shutdown via `close`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    ContainerStateStatusEnum, DeviceMapping, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{DaemonError, Result};

const CONTAINER_SSH_PORT: &str = "22/tcp";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub sandbox_id: String,
    pub user_id: Uuid,
    pub image: String,
    pub env: HashMap<String, String>,
    pub cpu_limit: f64,
    pub memory_limit: String,
    pub network: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl From<Option<ContainerStateStatusEnum>> for RuntimeState {
    fn from(status: Option<ContainerStateStatusEnum>) -> Self {
        match status {
            Some(ContainerStateStatusEnum::CREATED) => Self::Created,
            Some(ContainerStateStatusEnum::RUNNING) => Self::Running,
            Some(ContainerStateStatusEnum::PAUSED) => Self::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => Self::Restarting,
            Some(ContainerStateStatusEnum::REMOVING) => Self::Removing,
            Some(ContainerStateStatusEnum::EXITED) => Self::Exited,
            Some(ContainerStateStatusEnum::DEAD) => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inspection {
    pub state: RuntimeState,
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub pids: u64,
}

#[derive(Clone)]
pub struct ContainerDriver {
    client: Arc<Docker>,
}

impl ContainerDriver {
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| DaemonError::Internal(format!("failed to connect to container runtime: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Documents the shutdown hook contract; `bollard`'s HTTP client has no
    /// explicit close, so there is nothing further to release here.
    pub async fn close(&self) {}

    pub async fn run(&self, config: RunConfig) -> Result<ContainerHandle> {
        self.pull_image_if_missing(&config.image).await?;

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(CONTAINER_SSH_PORT.to_string(), HashMap::new());

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            CONTAINER_SSH_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }]),
        );

        let env_vars: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let labels: HashMap<String, String> = config.labels.clone();

        let host_config = HostConfig {
            cpu_period: Some(100_000),
            cpu_quota: Some((config.cpu_limit * 100_000.0) as i64),
            memory: Some(parse_memory_limit(&config.memory_limit)?),
            cap_add: Some(vec!["SYS_ADMIN".to_string()]),
            devices: Some(vec![DeviceMapping {
                path_on_host: Some("/dev/fuse".to_string()),
                path_in_container: Some("/dev/fuse".to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            }]),
            port_bindings: Some(port_bindings),
            network_mode: Some(config.network.clone()),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env_vars),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("sandbox-{}", config.sandbox_id);
        let options = Some(CreateContainerOptions {
            name,
            platform: None,
        });

        let created = self
            .client
            .create_container(options, container_config)
            .await?;

        self.client
            .start_container::<String>(&created.id, None)
            .await?;

        Ok(ContainerHandle { id: created.id })
    }

    async fn pull_image_if_missing(&self, image: &str) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let options = Some(bollard::image::CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(DaemonError::Runtime(format!("image pull failed: {e}")));
            }
        }
        Ok(())
    }

    pub async fn inspect(&self, id: &str) -> Result<Inspection> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(DaemonError::from)?;

        let state = RuntimeState::from(info.state.and_then(|s| s.status));

        let ssh_port = info
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(CONTAINER_SSH_PORT).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|p| p.parse::<u16>().ok());

        Ok(Inspection { state, ssh_port })
    }

    /// Runs `argv` inside the container as `user`, demuxing stdout/stderr.
    /// `tty` is disabled so the runtime keeps the two streams separate.
    pub async fn exec(&self, id: &str, argv: Vec<String>, user: &str) -> Result<ExecOutcome> {
        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(argv),
                    user: Some(user.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        if let StartExecResults::Attached { mut output, .. } =
            self.client.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(DaemonError::from)? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    /// Equivalent to `test -f <path>`; used by the readiness poll.
    pub async fn probe_file_exists(&self, id: &str, path: &str) -> Result<bool> {
        let outcome = self
            .exec(id, vec!["test".to_string(), "-f".to_string(), path.to_string()], "root")
            .await?;
        Ok(outcome.exit_code == 0)
    }

    pub async fn stop(&self, id: &str, grace_seconds: i64) -> Result<()> {
        match self
            .client
            .stop_container(id, Some(StopContainerOptions { t: grace_seconds }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(DaemonError::from(e)),
        }
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        match self
            .client
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(DaemonError::from(e)),
        }
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        match self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(DaemonError::from(e)),
        }
    }

    /// Best-effort remove, used to avoid orphan containers when a create
    /// fails partway through. Errors are logged, never surfaced.
    pub async fn force_remove_best_effort(&self, id: &str) {
        if let Err(e) = self.remove(id, true).await {
            warn!(container_id = %id, error = %e, "best-effort cleanup of orphan container failed");
        }
    }

    pub async fn logs(&self, id: &str, tail: &str) -> Result<(String, String)> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            timestamps: false,
            ..Default::default()
        });

        let mut stream = self.client.logs(id, options);
        let mut stdout = String::new();
        let mut stderr = String::new();

        while let Some(chunk) = stream.next().await {
            match chunk.map_err(DaemonError::from)? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                LogOutput::StdIn { .. } => {}
            }
        }

        Ok((stdout, stderr))
    }

    pub async fn stats(&self, id: &str) -> Result<SandboxStats> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });

        let mut stream = self.client.stats(id, options);
        let stats = stream
            .next()
            .await
            .ok_or_else(|| DaemonError::Runtime("no stats returned".to_string()))?
            .map_err(DaemonError::from)?;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);

        let cpu_percent = if system_delta > 0 {
            (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
        } else {
            0.0
        };

        let memory_usage = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit = stats.memory_stats.limit.unwrap_or(1).max(1);
        let memory_percent = (memory_usage as f64 / memory_limit as f64) * 100.0;

        let (rx_bytes, tx_bytes) = stats
            .networks
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(SandboxStats {
            cpu_percent,
            memory_usage_bytes: memory_usage,
            memory_limit_bytes: memory_limit,
            memory_percent,
            network_rx_bytes: rx_bytes,
            network_tx_bytes: tx_bytes,
            pids: stats.pids_stats.current.unwrap_or(0),
        })
    }

    /// Used by the reconciler: every container id currently live on the
    /// host carrying the orchestrator's label.
    pub async fn list_ids_with_label(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{key}={value}")]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

#[async_trait]
impl super::runtime::ContainerRuntime for ContainerDriver {
    async fn run(&self, config: RunConfig) -> Result<ContainerHandle> {
        ContainerDriver::run(self, config).await
    }

    async fn inspect(&self, id: &str) -> Result<Inspection> {
        ContainerDriver::inspect(self, id).await
    }

    async fn exec(&self, id: &str, argv: Vec<String>, user: &str) -> Result<ExecOutcome> {
        ContainerDriver::exec(self, id, argv, user).await
    }

    async fn probe_file_exists(&self, id: &str, path: &str) -> Result<bool> {
        ContainerDriver::probe_file_exists(self, id, path).await
    }

    async fn stop(&self, id: &str, grace_seconds: i64) -> Result<()> {
        ContainerDriver::stop(self, id, grace_seconds).await
    }

    async fn kill(&self, id: &str) -> Result<()> {
        ContainerDriver::kill(self, id).await
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        ContainerDriver::remove(self, id, force).await
    }

    async fn force_remove_best_effort(&self, id: &str) {
        ContainerDriver::force_remove_best_effort(self, id).await
    }

    async fn logs(&self, id: &str, tail: &str) -> Result<(String, String)> {
        ContainerDriver::logs(self, id, tail).await
    }

    async fn stats(&self, id: &str) -> Result<SandboxStats> {
        ContainerDriver::stats(self, id).await
    }

    async fn list_ids_with_label(&self, key: &str, value: &str) -> Result<Vec<String>> {
        ContainerDriver::list_ids_with_label(self, key, value).await
    }

    async fn close(&self) {
        ContainerDriver::close(self).await
    }
}

/// Parses Docker-style memory shorthand ("512m", "4g", "4096") into bytes.
fn parse_memory_limit(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('g' | 'G') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        Some('m' | 'M') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('k' | 'K') => (&raw[..raw.len() - 1], 1024),
        Some(c) if c.is_ascii_digit() => (raw, 1),
        _ => return Err(DaemonError::validation(format!("invalid memory limit: {raw}"))),
    };

    let value: i64 = digits
        .trim()
        .parse()
        .map_err(|_| DaemonError::validation(format!("invalid memory limit: {raw}")))?;

    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gigabyte_shorthand() {
        assert_eq!(parse_memory_limit("4g").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("2048").unwrap(), 2048);
    }

    #[test]
    fn rejects_garbage_memory_limit() {
        assert!(parse_memory_limit("lots").is_err());
        assert!(parse_memory_limit("").is_err());
    }

    #[test]
    fn runtime_state_maps_exited_and_running() {
        assert_eq!(
            RuntimeState::from(Some(ContainerStateStatusEnum::RUNNING)),
            RuntimeState::Running
        );
        assert_eq!(
            RuntimeState::from(Some(ContainerStateStatusEnum::EXITED)),
            RuntimeState::Exited
        );
        assert_eq!(RuntimeState::from(None), RuntimeState::Unknown);
    }
}
