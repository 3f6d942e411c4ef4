//! Agent configuration, as loaded from YAML and `FLEET_AGENT_*` variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::models::recovery::RecoveryConfig;

/// Main configuration structure for the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Host name reported to the coordinator; the system host name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Coordinator connection
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// On-disk locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Script execution
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Status polling
    #[serde(default)]
    pub status: StatusConfig,

    /// Heartbeat cadence and retry
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Local recovery policy defaults
    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CoordinatorConfig {
    /// Base URL, e.g. `http://coordinator:8440`
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_coordinator_url() -> String {
    "http://localhost:8440".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Cluster caches and recovery counters
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Root of service packages, hooks and custom actions
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,

    /// Staged command descriptors and structured output
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-agent/cache")
}

fn default_package_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-agent/packages")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-agent/tmp")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            package_dir: default_package_dir(),
            tmp_dir: default_tmp_dir(),
        }
    }
}

/// Script execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionConfig {
    /// Interpreter for `PYTHON` scripts
    #[serde(default = "default_python")]
    pub python_interpreter: String,

    /// Shell for `SHELL` scripts
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Seconds between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Upper bound on waiting for a killed group to disappear
    #[serde(default = "default_reap_timeout_secs")]
    pub reap_timeout_secs: u64,

    /// Lines kept from successful output
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,

    /// Lines kept before the first error marker in failed output
    #[serde(default = "default_failure_context_before")]
    pub failure_context_before: usize,

    /// Lines kept from the first error marker onwards in failed output
    #[serde(default = "default_failure_context_after")]
    pub failure_context_after: usize,

    /// Longest idle wait of the queue worker before re-checking
    #[serde(default = "default_queue_idle_wait_ms")]
    pub queue_idle_wait_ms: u64,

    /// Log level passed to scripts
    #[serde(default = "default_script_log_level")]
    pub script_log_level: String,
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

const fn default_kill_grace_secs() -> u64 {
    5
}

const fn default_reap_timeout_secs() -> u64 {
    10
}

const fn default_max_output_lines() -> usize {
    100
}

const fn default_failure_context_before() -> usize {
    10
}

const fn default_failure_context_after() -> usize {
    40
}

const fn default_queue_idle_wait_ms() -> u64 {
    1000
}

fn default_script_log_level() -> String {
    "INFO".to_string()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            python_interpreter: default_python(),
            shell: default_shell(),
            kill_grace_secs: default_kill_grace_secs(),
            reap_timeout_secs: default_reap_timeout_secs(),
            max_output_lines: default_max_output_lines(),
            failure_context_before: default_failure_context_before(),
            failure_context_after: default_failure_context_after(),
            queue_idle_wait_ms: default_queue_idle_wait_ms(),
            script_log_level: default_script_log_level(),
        }
    }
}

/// Status polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StatusConfig {
    /// Seconds between status sweeps
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

const fn default_poll_interval_secs() -> u64 {
    60
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Heartbeat cadence and retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Interval while no command is running
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,

    /// Interval while commands are queued or running
    #[serde(default = "default_busy_interval_secs")]
    pub busy_interval_secs: u64,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_idle_interval_secs() -> u64 {
    10
}

const fn default_busy_interval_secs() -> u64 {
    1
}

const fn default_initial_backoff_ms() -> u64 {
    1000
}

const fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: default_idle_interval_secs(),
            busy_interval_secs: default_busy_interval_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Local recovery defaults; the coordinator may override the policy part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecoverySettings {
    /// Window policy used until the coordinator sends its own
    #[serde(flatten)]
    pub policy: RecoveryConfig,

    /// Seconds between recovery evaluations
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
}

const fn default_evaluation_interval_secs() -> u64 {
    15
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            policy: RecoveryConfig::default(),
            evaluation_interval_secs: default_evaluation_interval_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            retention_days: default_retention_days(),
        }
    }
}
