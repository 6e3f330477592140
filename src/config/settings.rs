//! Daemon configuration, loaded from the environment under the `MATRX_`
//! prefix (see the configuration surface table). Construction validates
//! the handful of settings that have a closed set of legal values or a
//! shape constraint, and fails fast with a descriptive error rather than
//! letting a typo surface as a confusing runtime failure later.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_log_level() -> String {
    "INFO".into()
}
fn default_log_format() -> String {
    "json".into()
}
fn default_api_key_header() -> String {
    "X-API-Key".into()
}
fn default_sandbox_image() -> String {
    "matrx/sandbox:latest".into()
}
fn default_docker_network() -> String {
    "bridge".into()
}
fn default_container_cpu_limit() -> f64 {
    2.0
}
fn default_container_memory_limit() -> String {
    "4g".into()
}
fn default_container_disk_limit() -> String {
    "10g".into()
}
fn default_s3_region() -> String {
    "us-east-1".into()
}
fn default_max_session_duration_seconds() -> u64 {
    7200
}
fn default_shutdown_timeout_seconds() -> u64 {
    30
}
fn default_healthcheck_interval_seconds() -> u64 {
    30
}
fn default_max_command_length() -> usize {
    10_000
}
fn default_command_timeout_seconds() -> u64 {
    30
}
fn default_sandbox_store() -> String {
    "memory".into()
}

/// Settings as read directly from the environment (`MATRX_`-prefixed).
/// Field names match the lowercase of the suffix in the configuration
/// surface table, e.g. `MATRX_LOG_LEVEL` -> `log_level`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Empty/unset disables authentication entirely (local-dev mode).
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,

    #[serde(default = "default_docker_network")]
    pub docker_network: String,

    #[serde(default = "default_container_cpu_limit")]
    pub container_cpu_limit: f64,

    #[serde(default = "default_container_memory_limit")]
    pub container_memory_limit: String,

    #[serde(default = "default_container_disk_limit")]
    pub container_disk_limit: String,

    #[serde(default)]
    pub s3_bucket: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    #[serde(default = "default_max_session_duration_seconds")]
    pub max_session_duration_seconds: u64,

    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    #[serde(default = "default_healthcheck_interval_seconds")]
    pub healthcheck_interval_seconds: u64,

    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,

    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,

    /// `memory` or `postgres`.
    #[serde(default = "default_sandbox_store")]
    pub sandbox_store: String,

    #[serde(default)]
    pub database_url: Option<String>,
}

impl Settings {
    /// Load settings from the process environment, loading a local `.env`
    /// first if present (missing file is not an error).
    pub fn load() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("failed to load .env file: {}", e);
            }
        }

        let settings: Settings = envy::prefixed("MATRX_")
            .from_env()
            .context("failed to parse MATRX_ environment configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_uppercase().as_str()) {
            bail!(
                "MATRX_LOG_LEVEL must be one of {:?}, got {:?}",
                VALID_LOG_LEVELS,
                self.log_level
            );
        }

        if self.log_format != "json" && self.log_format != "text" {
            bail!(
                "MATRX_LOG_FORMAT must be \"json\" or \"text\", got {:?}",
                self.log_format
            );
        }

        if self.sandbox_store != "memory" && self.sandbox_store != "postgres" {
            bail!(
                "MATRX_SANDBOX_STORE must be \"memory\" or \"postgres\", got {:?}",
                self.sandbox_store
            );
        }

        if self.sandbox_store == "postgres" && self.database_url.is_none() {
            bail!("MATRX_DATABASE_URL is required when MATRX_SANDBOX_STORE=postgres");
        }

        if !self.s3_bucket.is_empty() {
            validate_bucket_name(&self.s3_bucket)
                .with_context(|| format!("MATRX_S3_BUCKET {:?} is invalid", self.s3_bucket))?;
        }

        Ok(())
    }
}

/// 3-63 chars, lowercase alphanumeric, dot or dash. Mirrors the S3 bucket
/// naming constraint the object-storage collaborator enforces.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if !(3..=63).contains(&name.len()) {
        bail!("bucket name must be 3-63 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        bail!("bucket name may only contain lowercase letters, digits, '.' and '-'");
    }
    Ok(())
}
