//! Command domain model.
//!
//! A command is one unit of work handed to the agent by the coordinator (or
//! synthesized by the recovery engine). Wire input is validated once, at the
//! ingestion boundary, by [`Command::from_wire`].

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::domain::errors::{AgentError, AgentResult};

/// Free-form JSON object carried through commands untouched.
pub type JsonMap = Map<String, Value>;

/// Default script timeout when the coordinator does not supply one.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Kind of command envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    /// Issued by the coordinator.
    #[default]
    ExecutionCommand,
    /// Issued locally by the recovery engine.
    AutoExecutionCommand,
    /// Periodic liveness check.
    StatusCommand,
}

impl CommandType {
    /// Wire spelling.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionCommand => "EXECUTION_COMMAND",
            Self::AutoExecutionCommand => "AUTO_EXECUTION_COMMAND",
            Self::StatusCommand => "STATUS_COMMAND",
        }
    }
}

/// Lifecycle verb applied to a component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RoleCommand {
    /// Lay down packages and configuration.
    Install,
    /// Bring the component up.
    Start,
    /// Bring the component down.
    Stop,
    /// Named custom command; the name lives in `hostLevelParams.custom_command`.
    CustomCommand,
    /// Cluster-independent custom action script.
    ActionExecute,
    /// Liveness check.
    Status,
    /// Any verb not known here, kept as sent.
    Other(String),
}

impl RoleCommand {
    /// Wire spelling; unknown verbs come back as received.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Install => "INSTALL",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::CustomCommand => "CUSTOM_COMMAND",
            Self::ActionExecute => "ACTIONEXECUTE",
            Self::Status => "STATUS",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for RoleCommand {
    fn from(value: String) -> Self {
        match value.to_uppercase().as_str() {
            "INSTALL" => Self::Install,
            "START" => Self::Start,
            "STOP" => Self::Stop,
            "CUSTOM_COMMAND" => Self::CustomCommand,
            "ACTIONEXECUTE" => Self::ActionExecute,
            "STATUS" => Self::Status,
            _ => Self::Other(value),
        }
    }
}

impl From<RoleCommand> for String {
    fn from(value: RoleCommand) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpreter family a command script is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    /// Run through the configured Python interpreter.
    Python,
    /// Run through the configured shell.
    Shell,
}

impl ScriptType {
    /// Parse a coordinator-supplied script type; `None` when unrecognized.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "PYTHON" => Some(Self::Python),
            "SHELL" | "SH" => Some(Self::Shell),
            _ => None,
        }
    }

    /// File extension used for hook scripts of this type.
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Shell => "sh",
        }
    }
}

/// Execution parameters attached to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    /// Script path, relative to the service package directory.
    #[serde(default)]
    pub script: String,

    /// `PYTHON` or `SHELL`.
    #[serde(default)]
    pub script_type: String,

    /// Seconds the script may run; strings and numbers are both accepted.
    #[serde(
        default = "default_command_timeout",
        deserialize_with = "lenient_u64"
    )]
    pub command_timeout: u64,

    /// Package directory of the service, relative to the package root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_package_folder: Option<String>,

    /// Hook directory, relative to the package root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks_folder: Option<String>,

    /// Anything else the coordinator sent; passed to the script verbatim.
    #[serde(flatten)]
    pub extra: JsonMap,
}

const fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

impl Default for CommandParams {
    fn default() -> Self {
        Self {
            script: String::new(),
            script_type: String::new(),
            command_timeout: default_command_timeout(),
            service_package_folder: None,
            hooks_folder: None,
            extra: JsonMap::new(),
        }
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    json_to_u64(&value).ok_or_else(|| de::Error::custom(format!("expected an integer, got {value}")))
}

fn json_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A validated unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Coordinator id, `<request>-<stage>`.
    pub command_id: String,
    /// Unique per command; used for cancellation and reporting.
    pub task_id: u64,
    /// Envelope kind.
    #[serde(default)]
    pub command_type: CommandType,
    /// Cluster the command belongs to.
    pub cluster_id: String,
    /// Display name of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// Host the command targets.
    pub hostname: String,
    /// Component role, e.g. `DATANODE`.
    pub role: String,
    /// Lifecycle verb.
    pub role_command: RoleCommand,
    /// Service owning the role.
    pub service_name: String,
    /// Component name when it differs from the role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    /// Configuration type to properties.
    #[serde(default)]
    pub configurations: JsonMap,
    /// Version tags of each configuration type.
    #[serde(default)]
    pub configuration_tags: JsonMap,
    /// Host-wide parameters; also carries `custom_command`.
    #[serde(default)]
    pub host_level_params: JsonMap,
    /// Hosts per role, compressed as index ranges on the wire.
    #[serde(default)]
    pub cluster_host_info: JsonMap,
    /// Script and timeout.
    #[serde(default)]
    pub command_params: CommandParams,
}

/// Raw wire shape: every field optional so validation can report what is missing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCommand {
    command_id: Option<Value>,
    task_id: Option<Value>,
    command_type: Option<CommandType>,
    cluster_id: Option<Value>,
    cluster_name: Option<String>,
    hostname: Option<String>,
    role: Option<String>,
    role_command: Option<String>,
    service_name: Option<String>,
    component_name: Option<String>,
    #[serde(default)]
    configurations: JsonMap,
    #[serde(default)]
    configuration_tags: JsonMap,
    #[serde(default)]
    host_level_params: JsonMap,
    #[serde(default)]
    cluster_host_info: JsonMap,
    command_params: Option<CommandParams>,
}

fn required(field: &str, value: Option<String>) -> AgentResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AgentError::InvalidCommand(format!("missing required field '{field}'")))
}

impl Command {
    /// Validate a coordinator-supplied JSON command.
    pub fn from_wire(value: Value) -> AgentResult<Self> {
        let wire: WireCommand = serde_json::from_value(value)
            .map_err(|e| AgentError::InvalidCommand(e.to_string()))?;

        let command_id = required("commandId", wire.command_id.as_ref().and_then(json_to_id))?;
        let task_id = wire
            .task_id
            .as_ref()
            .and_then(json_to_u64)
            .ok_or_else(|| AgentError::InvalidCommand("missing or non-numeric 'taskId'".into()))?;
        let command_type = wire.command_type.unwrap_or_default();

        let cluster_id = wire
            .cluster_id
            .as_ref()
            .and_then(json_to_id)
            .or_else(|| wire.cluster_name.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                AgentError::InvalidCommand("one of 'clusterId' or 'clusterName' is required".into())
            })?;

        let role_command = match wire.role_command {
            Some(rc) if !rc.trim().is_empty() => RoleCommand::from(rc),
            _ if command_type == CommandType::StatusCommand => RoleCommand::Status,
            _ => return Err(AgentError::InvalidCommand("missing required field 'roleCommand'".into())),
        };

        Ok(Self {
            command_id,
            task_id,
            command_type,
            cluster_id,
            cluster_name: wire.cluster_name,
            hostname: required("hostname", wire.hostname)?,
            role: required("role", wire.role)?,
            role_command,
            service_name: required("serviceName", wire.service_name)?,
            component_name: wire.component_name,
            configurations: wire.configurations,
            configuration_tags: wire.configuration_tags,
            host_level_params: wire.host_level_params,
            cluster_host_info: wire.cluster_host_info,
            command_params: wire.command_params.unwrap_or_default(),
        })
    }

    /// Best-effort identifiers of a command that failed validation, so a
    /// FAILED result can still be reported for it.
    pub fn salvage_ids(value: &Value) -> Option<(String, u64)> {
        let command_id = value.get("commandId").and_then(json_to_id)?;
        let task_id = value.get("taskId").and_then(json_to_u64)?;
        Some((command_id, task_id))
    }

    /// Name handed to the script: the custom command name for
    /// `CUSTOM_COMMAND`, `STATUS` for status checks, otherwise the role command.
    pub fn command_name(&self) -> String {
        if self.command_type == CommandType::StatusCommand {
            return self
                .host_level_params
                .get("custom_command")
                .and_then(Value::as_str)
                .unwrap_or(RoleCommand::Status.as_str())
                .to_string();
        }
        match self.role_command {
            RoleCommand::CustomCommand => self
                .custom_command()
                .unwrap_or_else(|| self.role_command.as_str().to_string()),
            _ => self.role_command.as_str().to_string(),
        }
    }

    /// Custom command name, when this is a `CUSTOM_COMMAND`.
    pub fn custom_command(&self) -> Option<String> {
        if self.role_command != RoleCommand::CustomCommand {
            return None;
        }
        self.host_level_params
            .get("custom_command")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Component this command acts on (falls back to the role).
    pub fn component(&self) -> &str {
        self.component_name.as_deref().unwrap_or(&self.role)
    }

    /// Script timeout.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.command_params.command_timeout)
    }

    /// Whether this is a periodic status check.
    pub fn is_status(&self) -> bool {
        self.command_type == CommandType::StatusCommand
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn datanode_install() -> Value {
        json!({
            "commandType": "EXECUTION_COMMAND",
            "commandId": "1-1",
            "taskId": 3,
            "clusterName": "cc",
            "hostname": "c6401.ambari.apache.org",
            "role": "DATANODE",
            "roleCommand": "INSTALL",
            "serviceName": "HDFS",
            "configurations": {"global": {}},
            "configurationTags": {"global": {"tag": "v1"}},
            "hostLevelParams": {},
            "commandParams": {
                "script": "scripts/datanode.py",
                "script_type": "PYTHON",
                "command_timeout": "600",
                "service_package_folder": "stacks/HDP/2.0.6/services/HDFS/package"
            }
        })
    }

    #[test]
    fn test_from_wire_valid_command() {
        let cmd = Command::from_wire(datanode_install()).unwrap();
        assert_eq!(cmd.command_id, "1-1");
        assert_eq!(cmd.task_id, 3);
        assert_eq!(cmd.cluster_id, "cc");
        assert_eq!(cmd.role_command, RoleCommand::Install);
        assert_eq!(cmd.command_params.command_timeout, 600);
        assert_eq!(cmd.timeout(), Duration::from_secs(600));
        assert_eq!(cmd.component(), "DATANODE");
    }

    #[test]
    fn test_from_wire_numeric_ids() {
        let mut raw = datanode_install();
        raw["commandId"] = json!(17);
        raw["taskId"] = json!("42");
        raw["clusterId"] = json!(5);
        let cmd = Command::from_wire(raw).unwrap();
        assert_eq!(cmd.command_id, "17");
        assert_eq!(cmd.task_id, 42);
        assert_eq!(cmd.cluster_id, "5");
        assert_eq!(cmd.cluster_name.as_deref(), Some("cc"));
    }

    #[test]
    fn test_from_wire_rejects_missing_role() {
        let mut raw = datanode_install();
        raw.as_object_mut().unwrap().remove("role");
        let err = Command::from_wire(raw).unwrap_err();
        assert!(err.to_string().contains("'role'"));
    }

    #[test]
    fn test_from_wire_rejects_missing_cluster() {
        let mut raw = datanode_install();
        raw.as_object_mut().unwrap().remove("clusterName");
        assert!(matches!(
            Command::from_wire(raw),
            Err(AgentError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_from_wire_rejects_bad_timeout() {
        let mut raw = datanode_install();
        raw["commandParams"]["command_timeout"] = json!("soon");
        assert!(Command::from_wire(raw).is_err());
    }

    #[test]
    fn test_salvage_ids_from_invalid_command() {
        let raw = json!({"commandId": "9-2", "taskId": 12});
        assert!(Command::from_wire(raw.clone()).is_err());
        assert_eq!(Command::salvage_ids(&raw), Some(("9-2".to_string(), 12)));
    }

    #[test]
    fn test_custom_command_name() {
        let mut raw = datanode_install();
        raw["roleCommand"] = json!("CUSTOM_COMMAND");
        raw["hostLevelParams"] = json!({"custom_command": "RESTART"});
        let cmd = Command::from_wire(raw).unwrap();
        assert_eq!(cmd.command_name(), "RESTART");
        assert_eq!(cmd.custom_command().as_deref(), Some("RESTART"));
    }

    #[test]
    fn test_status_command_defaults_role_command() {
        let mut raw = datanode_install();
        raw["commandType"] = json!("STATUS_COMMAND");
        raw.as_object_mut().unwrap().remove("roleCommand");
        let cmd = Command::from_wire(raw).unwrap();
        assert_eq!(cmd.role_command, RoleCommand::Status);
        assert_eq!(cmd.command_name(), "STATUS");
        assert!(cmd.is_status());
    }

    #[test]
    fn test_role_command_round_trips_unknown_names() {
        let rc = RoleCommand::from("UPGRADE".to_string());
        assert_eq!(rc, RoleCommand::Other("UPGRADE".to_string()));
        assert_eq!(String::from(rc), "UPGRADE");
    }

    #[test]
    fn test_script_type_parse() {
        assert_eq!(ScriptType::parse("python"), Some(ScriptType::Python));
        assert_eq!(ScriptType::parse("SHELL"), Some(ScriptType::Shell));
        assert_eq!(ScriptType::parse("PUPPET"), None);
    }

    #[test]
    fn test_command_params_keep_extra_fields() {
        let params: CommandParams = serde_json::from_value(json!({
            "script": "scripts/x.py",
            "script_type": "PYTHON",
            "jdk_location": "http://server:8080/resources/"
        }))
        .unwrap();
        assert_eq!(params.command_timeout, DEFAULT_COMMAND_TIMEOUT_SECS);
        assert_eq!(
            params.extra.get("jdk_location").and_then(Value::as_str),
            Some("http://server:8080/resources/")
        );
    }
}
