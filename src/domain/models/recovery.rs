//! Recovery policy model: configuration, per-component state and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::domain::models::command::RoleCommand;
use crate::domain::models::status::ComponentState;

/// Which recovery actions the agent may take on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryMode {
    /// No automatic recovery.
    #[default]
    Disabled,
    /// Restart components that should be running.
    AutoStart,
    /// Also reinstall components whose install failed.
    AutoInstallStart,
    /// Drive components to any desired state.
    Full,
}

impl RecoveryMode {
    /// Parse a coordinator mode name; `DEFAULT` means disabled.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "DEFAULT" | "DISABLED" => Some(Self::Disabled),
            "AUTO_START" => Some(Self::AutoStart),
            "AUTO_INSTALL_START" => Some(Self::AutoInstallStart),
            "FULL" => Some(Self::Full),
            _ => None,
        }
    }

    /// Whether any recovery may happen.
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Window policy parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Which actions are allowed.
    #[serde(default)]
    pub mode: RecoveryMode,

    /// Allowed recovery attempts inside one window.
    #[serde(default = "default_max_count")]
    pub max_count: u32,

    /// Length of the sliding window.
    #[serde(default = "default_window_in_minutes")]
    pub window_in_minutes: u32,

    /// Minimum minutes between two attempts on the same component.
    #[serde(default = "default_retry_gap")]
    pub retry_gap: u32,

    /// Attempts allowed over the agent's lifetime.
    #[serde(default = "default_max_lifetime_count")]
    pub max_lifetime_count: u32,

    /// Components eligible for recovery. Upper-cased component names.
    #[serde(default)]
    pub enabled_components: BTreeSet<String>,
}

const fn default_max_count() -> u32 {
    6
}

const fn default_window_in_minutes() -> u32 {
    60
}

const fn default_retry_gap() -> u32 {
    5
}

const fn default_max_lifetime_count() -> u32 {
    12
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::Disabled,
            max_count: default_max_count(),
            window_in_minutes: default_window_in_minutes(),
            retry_gap: default_retry_gap(),
            max_lifetime_count: default_max_lifetime_count(),
            enabled_components: BTreeSet::new(),
        }
    }
}

impl RecoveryConfig {
    /// Check the window parameters for internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if !self.mode.is_enabled() {
            return Ok(());
        }
        if self.max_count == 0 {
            return Err("max_count must be greater than zero".to_string());
        }
        if self.window_in_minutes == 0 {
            return Err("window_in_minutes must be greater than zero".to_string());
        }
        if self.retry_gap < 1 {
            return Err("retry_gap must be at least one minute".to_string());
        }
        if self.retry_gap >= self.window_in_minutes {
            return Err(format!(
                "retry_gap ({}) must be smaller than window_in_minutes ({})",
                self.retry_gap, self.window_in_minutes
            ));
        }
        if self.max_lifetime_count < self.max_count {
            return Err(format!(
                "max_lifetime_count ({}) must not be smaller than max_count ({})",
                self.max_lifetime_count, self.max_count
            ));
        }
        Ok(())
    }

    /// Apply a coordinator-supplied `recoveryConfig` object on top of `self`.
    ///
    /// Unknown keys are ignored. Numeric fields accept numbers or numeric
    /// strings; an unparseable field is an error.
    pub fn merged_with_coordinator(&self, raw: &Value) -> Result<Self, String> {
        let mut merged = self.clone();

        if let Some(kind) = raw.get("type").and_then(Value::as_str) {
            merged.mode = RecoveryMode::parse(kind)
                .ok_or_else(|| format!("unknown recovery type '{kind}'"))?;
        }
        if let Some(v) = raw.get("maxCount") {
            merged.max_count = numeric("maxCount", v)?;
        }
        if let Some(v) = raw.get("windowInMinutes") {
            merged.window_in_minutes = numeric("windowInMinutes", v)?;
        }
        if let Some(v) = raw.get("retryGap") {
            merged.retry_gap = numeric("retryGap", v)?;
        }
        if let Some(v) = raw.get("maxLifetimeCount") {
            merged.max_lifetime_count = numeric("maxLifetimeCount", v)?;
        }
        match raw.get("components") {
            Some(Value::String(csv)) => {
                merged.enabled_components = csv
                    .split(',')
                    .map(|c| c.trim().to_uppercase())
                    .filter(|c| !c.is_empty())
                    .collect();
            }
            Some(Value::Array(items)) => {
                merged.enabled_components = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(name.as_str()),
                        Value::Object(obj) => obj.get("component_name").and_then(Value::as_str),
                        _ => None,
                    })
                    .map(|c| c.trim().to_uppercase())
                    .filter(|c| !c.is_empty())
                    .collect();
            }
            _ => {}
        }

        merged.validate()?;
        Ok(merged)
    }

    /// Desired states carried by an object-style `components` list
    /// (`[{"component_name": .., "desired_state": ..}]`).
    pub fn desired_states(raw: &Value) -> Vec<(String, ComponentState)> {
        let Some(Value::Array(items)) = raw.get("components") else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let name = item.get("component_name")?.as_str()?;
                let state = match item.get("desired_state")?.as_str()? {
                    "STARTED" => ComponentState::Started,
                    "INSTALLED" => ComponentState::Installed,
                    _ => return None,
                };
                Some((name.trim().to_uppercase(), state))
            })
            .collect()
    }

    /// Whether `component` is covered by recovery.
    pub fn covers(&self, component: &str) -> bool {
        self.mode.is_enabled() && self.enabled_components.contains(&component.to_uppercase())
    }
}

fn numeric(field: &str, value: &Value) -> Result<u32, String> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| format!("'{field}' is not a valid count: {value}"))
}

/// Command the engine issues to move a component towards its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    /// (Re)install the component.
    Install,
    /// Start an installed component.
    Start,
    /// Stop a running component.
    Stop,
    /// Restart a running component so it picks up changed configuration.
    Restart,
}

impl RecoveryAction {
    /// Role command carried by the recovery command.
    pub fn role_command(&self) -> RoleCommand {
        match self {
            Self::Install => RoleCommand::Install,
            Self::Start => RoleCommand::Start,
            Self::Stop => RoleCommand::Stop,
            Self::Restart => RoleCommand::CustomCommand,
        }
    }

    /// Custom command name, for actions sent as `CUSTOM_COMMAND`.
    pub const fn custom_command(&self) -> Option<&'static str> {
        match self {
            Self::Restart => Some("RESTART"),
            _ => None,
        }
    }
}

/// Lifecycle phase the engine believes a component to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    /// Running as desired.
    Started,
    /// Installed, not meant to run or not yet known.
    #[default]
    Installed,
    /// Should run but does not, or runs with stale configuration.
    NeedsRestart,
}

/// Outcome of the last window evaluation for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyState {
    /// Attempts available.
    #[default]
    Healthy,
    /// Waiting out the retry gap.
    Cooldown,
    /// Window or lifetime limit reached.
    Exhausted,
}

/// Per-component bookkeeping, persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    /// Attempts inside the current window.
    #[serde(default)]
    pub failure_timestamps: Vec<DateTime<Utc>>,
    /// When the last attempt was made.
    #[serde(default)]
    pub last_action_time: Option<DateTime<Utc>>,
    /// Attempts since the counters were created.
    #[serde(default)]
    pub lifetime_count: u32,
    /// Derived from `desired` and `current`.
    #[serde(default)]
    pub phase: RecoveryPhase,
    /// Result of the last window check.
    #[serde(default)]
    pub policy: PolicyState,
    /// State the coordinator last asked for.
    #[serde(default)]
    pub desired: Option<ComponentState>,
    /// State last observed or reached by a command.
    #[serde(default)]
    pub current: Option<ComponentState>,
    /// Configuration changed since the component was last installed,
    /// started or restarted.
    #[serde(default)]
    pub stale_config: bool,
    /// Whether the exhaustion warning was already logged.
    #[serde(default, skip_serializing)]
    pub warned: bool,
}

/// Decision returned by a window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Go ahead.
    Allowed,
    /// Too soon after the last attempt.
    Cooldown,
    /// No attempts left.
    Exhausted,
}

impl RecoveryDecision {
    /// Whether an attempt may be made.
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Overall recovery health of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoverySummary {
    /// Recovery is off.
    Disabled,
    /// Every component has attempts left.
    Recoverable,
    /// Some components hit their limit.
    PartiallyRecoverable,
    /// Every component hit its limit.
    Unrecoverable,
}

/// Attempt count of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRecoveryReport {
    /// Component name.
    pub name: String,
    /// Attempts inside the current window.
    pub num_attempts: u32,
    /// Whether the window or lifetime limit is reached.
    pub limit_reached: bool,
}

/// Recovery summary attached to every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Overall state.
    pub summary: RecoverySummary,
    /// One entry per enabled component.
    #[serde(default)]
    pub component_reports: Vec<ComponentRecoveryReport>,
}

impl RecoveryReport {
    /// Report sent while recovery is off.
    pub const fn disabled() -> Self {
        Self {
            summary: RecoverySummary::Disabled,
            component_reports: Vec::new(),
        }
    }

    /// Summarize a set of component reports.
    pub fn from_components(component_reports: Vec<ComponentRecoveryReport>) -> Self {
        let exhausted = component_reports.iter().filter(|r| r.limit_reached).count();
        let summary = if exhausted == 0 {
            RecoverySummary::Recoverable
        } else if exhausted == component_reports.len() {
            RecoverySummary::Unrecoverable
        } else {
            RecoverySummary::PartiallyRecoverable
        };
        Self {
            summary,
            component_reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enabled() -> RecoveryConfig {
        RecoveryConfig {
            mode: RecoveryMode::AutoStart,
            ..RecoveryConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RecoveryConfig::default().validate().is_ok());
        assert!(enabled().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_gap_not_smaller_than_window() {
        let config = RecoveryConfig {
            retry_gap: 60,
            ..enabled()
        };
        assert!(config.validate().unwrap_err().contains("retry_gap"));
    }

    #[test]
    fn test_validate_rejects_lifetime_below_window_count() {
        let config = RecoveryConfig {
            max_lifetime_count: 2,
            ..enabled()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_config_skips_validation() {
        let config = RecoveryConfig {
            max_count: 0,
            ..RecoveryConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_coordinator_config() {
        let raw = json!({
            "type": "AUTO_INSTALL_START",
            "maxCount": "3",
            "windowInMinutes": 30,
            "retryGap": 2,
            "maxLifetimeCount": 10,
            "components": "datanode, NameNode"
        });
        let merged = RecoveryConfig::default().merged_with_coordinator(&raw).unwrap();
        assert_eq!(merged.mode, RecoveryMode::AutoInstallStart);
        assert_eq!(merged.max_count, 3);
        assert_eq!(merged.window_in_minutes, 30);
        assert!(merged.covers("DATANODE"));
        assert!(merged.covers("namenode"));
        assert!(!merged.covers("ZOOKEEPER_SERVER"));
    }

    #[test]
    fn test_merge_object_component_list() {
        let raw = json!({
            "type": "AUTO_START",
            "components": [
                {"component_name": "datanode", "desired_state": "STARTED"},
                {"component_name": "NAMENODE", "desired_state": "INSTALLED"}
            ]
        });
        let merged = RecoveryConfig::default().merged_with_coordinator(&raw).unwrap();
        assert!(merged.covers("DATANODE"));
        assert_eq!(
            RecoveryConfig::desired_states(&raw),
            vec![
                ("DATANODE".to_string(), ComponentState::Started),
                ("NAMENODE".to_string(), ComponentState::Installed),
            ]
        );
    }

    #[test]
    fn test_merge_rejects_invalid_values() {
        let raw = json!({"type": "AUTO_START", "maxCount": "lots"});
        assert!(RecoveryConfig::default().merged_with_coordinator(&raw).is_err());

        let raw = json!({"type": "AUTO_START", "retryGap": 0});
        assert!(RecoveryConfig::default().merged_with_coordinator(&raw).is_err());
    }

    #[test]
    fn test_report_summary() {
        let ok = ComponentRecoveryReport {
            name: "DATANODE".into(),
            num_attempts: 1,
            limit_reached: false,
        };
        let spent = ComponentRecoveryReport {
            name: "NAMENODE".into(),
            num_attempts: 6,
            limit_reached: true,
        };

        assert_eq!(
            RecoveryReport::from_components(vec![ok.clone()]).summary,
            RecoverySummary::Recoverable
        );
        assert_eq!(
            RecoveryReport::from_components(vec![ok, spent.clone()]).summary,
            RecoverySummary::PartiallyRecoverable
        );
        assert_eq!(
            RecoveryReport::from_components(vec![spent]).summary,
            RecoverySummary::Unrecoverable
        );
    }
}
