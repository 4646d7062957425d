use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AgentType;

/// Top-level configuration loaded from `~/.foreman/config.toml`.
///
/// Every section has defaults, so an empty file (or no file at all) yields a
/// working setup backed by `~/.foreman/`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub failure: FailureConfig,
    #[serde(default)]
    pub runners: BTreeMap<String, RunnerConfig>,
}

impl Config {
    /// Load config from `~/.foreman/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.context.validate()?;
        self.queue.validate()?;
        self.workflow.validate()?;
        self.failure.validate()?;
        for (agent_type, runner) in &self.runners {
            agent_type
                .parse::<AgentType>()
                .map_err(|e| ConfigError::Validation(format!("runners: {e}")))?;
            if runner.command.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "runners.{agent_type}.command must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Runner configured for `agent_type`, matching keys like `dev` or `developer`.
    pub fn runner_for(&self, agent_type: AgentType) -> Option<&RunnerConfig> {
        self.runners
            .iter()
            .find(|(key, _)| key.parse::<AgentType>().ok() == Some(agent_type))
            .map(|(_, runner)| runner)
    }

    pub fn default_path() -> PathBuf {
        Self::home().join("config.toml")
    }

    pub(crate) fn home() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_project_name() -> String {
    "foreman".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            archive_dir: default_archive_dir(),
        }
    }
}

fn default_db_path() -> PathBuf {
    Config::home().join("foreman.db")
}
fn default_archive_dir() -> PathBuf {
    Config::home().join("archive")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Largest payload (bytes) kept in the active cache.
    #[serde(default = "default_active_limit")]
    pub active_limit_bytes: usize,
    /// Largest payload (bytes) stored inline in the recent store.
    #[serde(default = "default_recent_limit")]
    pub recent_limit_bytes: usize,
    #[serde(default = "default_active_ttl")]
    pub active_ttl_secs: u64,
    #[serde(default = "default_archive_after")]
    pub archive_after_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            active_limit_bytes: default_active_limit(),
            recent_limit_bytes: default_recent_limit(),
            active_ttl_secs: default_active_ttl(),
            archive_after_secs: default_archive_after(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl ContextConfig {
    pub fn active_ttl(&self) -> Duration {
        Duration::from_secs(self.active_ttl_secs)
    }

    pub fn archive_after(&self) -> Duration {
        Duration::from_secs(self.archive_after_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.active_limit_bytes == 0 || self.active_limit_bytes > self.recent_limit_bytes {
            return Err(ConfigError::Validation(
                "context.active_limit_bytes must be > 0 and <= context.recent_limit_bytes".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Validation(
                "context.cache_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_active_limit() -> usize {
    1024 * 1024
}
fn default_recent_limit() -> usize {
    10 * 1024 * 1024
}
fn default_active_ttl() -> u64 {
    3600
}
fn default_archive_after() -> u64 {
    24 * 3600
}
fn default_cache_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// How long finished jobs stay queryable before maintenance drops them.
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            job_retention_secs: default_job_retention(),
        }
    }
}

impl QueueConfig {
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "queue.max_attempts must be >= 1".into(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Validation(
                "queue.backoff_base_ms must be <= queue.backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_job_retention() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Default QA retry budget when a task does not specify one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on workflows kept in memory.
    #[serde(default = "default_max_workflows")]
    pub max_workflows: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_workflows: default_max_workflows(),
        }
    }
}

impl WorkflowConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workflows == 0 {
            return Err(ConfigError::Validation(
                "workflow.max_workflows must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_max_workflows() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureConfig {
    /// File modifications without a passing test before a loop is declared.
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,
    #[serde(default = "default_max_session_secs")]
    pub max_session_secs: u64,
    /// Automatic recovery attempts per session before escalation.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            loop_threshold: default_loop_threshold(),
            max_session_secs: default_max_session_secs(),
            max_recovery_attempts: default_max_recovery_attempts(),
            check_interval_secs: default_check_interval(),
        }
    }
}

impl FailureConfig {
    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_threshold == 0 {
            return Err(ConfigError::Validation(
                "failure.loop_threshold must be > 0".into(),
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "failure.check_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_loop_threshold() -> u32 {
    20
}
fn default_max_session_secs() -> u64 {
    4 * 3600
}
fn default_max_recovery_attempts() -> u32 {
    3
}
fn default_check_interval() -> u64 {
    60
}

/// External command that executes tasks for one agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_runner_timeout")]
    pub timeout_secs: u64,
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_runner_timeout() -> u64 {
    1800
}
