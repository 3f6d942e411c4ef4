//! Layered configuration loading and validation.

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::models::config::Config;

/// Config file read when none is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleet-agent/agent.yaml";

/// Prefix of environment overrides; `__` separates nested keys
pub const ENV_PREFIX: &str = "FLEET_AGENT_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Log level outside the tracing levels
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Log format other than json or pretty
    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    /// Missing coordinator url
    #[error("Coordinator url cannot be empty")]
    EmptyCoordinatorUrl,

    /// An interval that must be positive is zero
    #[error("Invalid {0}: must be greater than zero")]
    ZeroInterval(&'static str),

    /// Initial backoff not below the maximum
    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    /// Recovery policy rejected
    #[error("Invalid recovery configuration: {0}")]
    InvalidRecovery(String),

    /// Catch-all validation failure
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. YAML file (`path`, or [`DEFAULT_CONFIG_PATH`]); a missing file is skipped
    /// 3. Environment variables (`FLEET_AGENT_*` prefix, highest priority)
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let file = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", file.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.coordinator.url.trim().is_empty() {
            return Err(ConfigError::EmptyCoordinatorUrl);
        }

        let intervals = [
            ("status.poll_interval_secs", config.status.poll_interval_secs),
            ("heartbeat.idle_interval_secs", config.heartbeat.idle_interval_secs),
            ("heartbeat.busy_interval_secs", config.heartbeat.busy_interval_secs),
            (
                "recovery.evaluation_interval_secs",
                config.recovery.evaluation_interval_secs,
            ),
            ("execution.queue_idle_wait_ms", config.execution.queue_idle_wait_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if config.heartbeat.initial_backoff_ms >= config.heartbeat.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.heartbeat.initial_backoff_ms,
                config.heartbeat.max_backoff_ms,
            ));
        }

        if config.execution.max_output_lines == 0 {
            return Err(ConfigError::ValidationFailed(
                "execution.max_output_lines must be at least 1".to_string(),
            ));
        }

        if config.execution.python_interpreter.trim().is_empty()
            || config.execution.shell.trim().is_empty()
        {
            return Err(ConfigError::ValidationFailed(
                "execution interpreters cannot be empty".to_string(),
            ));
        }

        config
            .recovery
            .policy
            .validate()
            .map_err(ConfigError::InvalidRecovery)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::recovery::RecoveryMode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.status.poll_interval_secs, 60);
        assert_eq!(config.recovery.policy.max_count, 6);
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
hostname: node-17
coordinator:
  url: http://coordinator:8440
paths:
  cache_dir: /tmp/agent/cache
execution:
  max_output_lines: 50
recovery:
  mode: AUTO_START
  max_count: 3
  enabled_components: [DATANODE]
  evaluation_interval_secs: 30
logging:
  level: debug
  format: pretty
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.hostname.as_deref(), Some("node-17"));
        assert_eq!(config.coordinator.url, "http://coordinator:8440");
        assert_eq!(config.paths.cache_dir, PathBuf::from("/tmp/agent/cache"));
        assert_eq!(config.execution.max_output_lines, 50);
        assert_eq!(config.recovery.policy.mode, RecoveryMode::AutoStart);
        assert_eq!(config.recovery.policy.max_count, 3);
        assert_eq!(config.recovery.evaluation_interval_secs, 30);
        assert_eq!(config.logging.format, "pretty");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidLogFormat(_)
        ));
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut config = Config::default();
        config.status.poll_interval_secs = 0;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::ZeroInterval("status.poll_interval_secs")
        ));
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.heartbeat.initial_backoff_ms = 30000;
        config.heartbeat.max_backoff_ms = 10000;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidBackoff(30000, 10000)
        ));
    }

    #[test]
    fn test_validate_invalid_recovery() {
        let mut config = Config::default();
        config.recovery.policy.mode = RecoveryMode::Full;
        config.recovery.policy.retry_gap = 90;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidRecovery(_)
        ));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load(Some(&dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config.heartbeat.idle_interval_secs, 10);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = yaml_file("status:\n  poll_interval_secs: 20\nlogging:\n  level: warn\n");

        temp_env::with_vars(
            [
                ("FLEET_AGENT_STATUS__POLL_INTERVAL_SECS", Some("5")),
                ("FLEET_AGENT_HOSTNAME", Some("env-host")),
            ],
            || {
                let config = ConfigLoader::load(Some(file.path())).unwrap();
                assert_eq!(config.status.poll_interval_secs, 5, "env should win");
                assert_eq!(config.logging.level, "warn", "file value should persist");
                assert_eq!(config.hostname.as_deref(), Some("env-host"));
            },
        );
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let file = yaml_file("heartbeat:\n  busy_interval_secs: 0\n");
        assert!(ConfigLoader::load(Some(file.path())).is_err());
    }
}
