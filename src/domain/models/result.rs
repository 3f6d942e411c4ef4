//! Command results reported back to the coordinator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::command::{Command, JsonMap, RoleCommand};

/// Exit code attached to in-progress reports.
pub const IN_PROGRESS_EXIT_CODE: i32 = 777;

/// Exit code of a command killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How a command ended, or that it is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Exit code 0.
    Completed,
    /// Non-zero exit, timeout, cancellation or rejection.
    Failed,
    /// Still running; only used in snapshots.
    InProgress,
}

/// Outcome of exactly one dequeued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Role of the command.
    pub role: String,
    /// Role command of the command.
    pub role_command: RoleCommand,
    /// Command id the result answers.
    pub action_id: String,
    /// Task id the result answers.
    pub task_id: u64,
    /// Script stdout, trimmed to the output window.
    pub stdout: String,
    /// Script stderr, trimmed to the output window.
    pub stderr: String,
    /// Process exit code; 124 for timeouts.
    pub exit_code: i32,
    /// Cluster the command ran for.
    pub cluster_name: String,
    /// Service of the command.
    pub service_name: String,
    /// Final or running status.
    pub status: CommandStatus,
    /// Custom command name, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_command: Option<String>,
    /// Tags of the configuration the command ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_tags: Option<JsonMap>,
    /// JSON object the script left in its structured-output file; `{}` when
    /// it wrote none.
    #[serde(default = "empty_object")]
    pub structured_out: Value,
}

fn empty_object() -> Value {
    Value::Object(JsonMap::new())
}

impl CommandResult {
    /// Build a result from a finished execution. Exit code 0 is COMPLETED.
    pub fn from_exit(cmd: &Command, exit_code: i32, stdout: String, stderr: String) -> Self {
        let status = if exit_code == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        let configuration_tags = (status == CommandStatus::Completed
            && !cmd.configuration_tags.is_empty())
        .then(|| cmd.configuration_tags.clone());

        Self {
            role: cmd.role.clone(),
            role_command: cmd.role_command.clone(),
            action_id: cmd.command_id.clone(),
            task_id: cmd.task_id,
            stdout,
            stderr,
            exit_code,
            cluster_name: cmd.cluster_name.clone().unwrap_or_else(|| cmd.cluster_id.clone()),
            service_name: cmd.service_name.clone(),
            status,
            custom_command: cmd.custom_command(),
            configuration_tags,
            structured_out: empty_object(),
        }
    }

    /// Attach the script's structured output.
    #[must_use]
    pub fn with_structured_out(mut self, structured_out: Value) -> Self {
        self.structured_out = structured_out;
        self
    }

    /// FAILED result carrying `message` as both stdout and stderr.
    pub fn failed(cmd: &Command, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_exit(cmd, 1, message.clone(), message)
    }

    /// FAILED result for a command that never passed validation.
    pub fn rejected(action_id: String, task_id: u64, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            role: String::new(),
            role_command: RoleCommand::Other(String::new()),
            action_id,
            task_id,
            stdout: message.clone(),
            stderr: message,
            exit_code: 1,
            cluster_name: String::new(),
            service_name: String::new(),
            status: CommandStatus::Failed,
            custom_command: None,
            configuration_tags: None,
            structured_out: empty_object(),
        }
    }

    /// Snapshot of a command that is still running.
    pub fn in_progress(cmd: &Command) -> Self {
        Self {
            status: CommandStatus::InProgress,
            configuration_tags: None,
            ..Self::from_exit(cmd, IN_PROGRESS_EXIT_CODE, String::new(), String::new())
        }
    }

    /// Whether the command completed.
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command() -> Command {
        Command::from_wire(json!({
            "commandId": "2-1",
            "taskId": 7,
            "clusterId": "1",
            "clusterName": "c1",
            "hostname": "h1",
            "role": "NAMENODE",
            "roleCommand": "START",
            "serviceName": "HDFS",
            "configurationTags": {"core-site": {"tag": "version1"}}
        }))
        .unwrap()
    }

    #[test]
    fn test_from_exit_success_carries_tags() {
        let result = CommandResult::from_exit(&command(), 0, "ok".into(), String::new());
        assert_eq!(result.status, CommandStatus::Completed);
        assert_eq!(result.cluster_name, "c1");
        assert_eq!(result.action_id, "2-1");
        assert!(result.configuration_tags.is_some());
    }

    #[test]
    fn test_failed_result() {
        let result = CommandResult::failed(&command(), "boom");
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, "boom");
        assert!(result.configuration_tags.is_none());
        assert_eq!(serde_json::to_value(&result).unwrap()["structuredOut"], json!({}));
    }

    #[test]
    fn test_in_progress_wire_format() {
        let json = serde_json::to_value(CommandResult::in_progress(&command())).unwrap();
        assert_eq!(json["status"], "IN_PROGRESS");
        assert_eq!(json["exitCode"], IN_PROGRESS_EXIT_CODE);
        assert_eq!(json["roleCommand"], "START");
        assert!(json.get("configurationTags").is_none());
    }
}
