//! Coordinator exchange messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::models::recovery::RecoveryReport;
use crate::domain::models::result::CommandResult;
use crate::domain::models::status::ComponentStatus;

/// Host health as the coordinator sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// `HEALTHY` unless something is badly wrong.
    pub status: String,
    /// Why the node is not healthy; `NONE` otherwise.
    pub cause: String,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            status: "HEALTHY".to_string(),
            cause: "NONE".to_string(),
        }
    }
}

/// Periodic report sent to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Id of the last response received, echoed back.
    pub response_id: i64,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    /// This host.
    pub hostname: String,
    /// Node health.
    pub node_status: NodeStatus,
    /// Statuses changed since the last heartbeat.
    pub component_status: Vec<ComponentStatus>,
    /// Finished command results, then in-progress snapshots.
    pub reports: Vec<CommandResult>,
    /// Recovery attempt counts.
    pub recovery_report: RecoveryReport,
}

/// New content for one cache kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheUpdate {
    /// Hash of the new content; kept to detect staleness on re-registration.
    #[serde(default)]
    pub hash: Option<String>,
    /// Full replacement content, keyed by cluster id.
    #[serde(default)]
    pub clusters: BTreeMap<String, Value>,
}

/// Request to abort a queued or running command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelCommand {
    /// Task to abort.
    pub target_task_id: u64,
    /// Shown in the aborted result.
    #[serde(default)]
    pub reason: String,
}

/// Coordinator reply to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// Must be one more than the id the agent sent.
    pub response_id: i64,
    /// Raw commands; validated on ingestion.
    #[serde(default)]
    pub execution_commands: Vec<Value>,
    /// Tasks to abort.
    #[serde(default)]
    pub cancel_commands: Vec<CancelCommand>,
    /// Present when the coordinator wants the agent to register again.
    #[serde(default)]
    pub registration_command: Option<Value>,
    /// Asks the agent process to restart.
    #[serde(default)]
    pub restart_agent: bool,
    /// Recovery policy override.
    #[serde(default)]
    pub recovery_config: Option<Value>,
    /// Cache kinds whose content changed.
    #[serde(default)]
    pub cluster_caches: Option<BTreeMap<String, CacheUpdate>>,
}

impl HeartbeatResponse {
    /// Whether the coordinator asked for a fresh registration.
    pub const fn wants_registration(&self) -> bool {
        self.registration_command.is_some()
    }
}

/// Registration request sent on startup and whenever the coordinator asks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// This host.
    pub hostname: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    /// Always `-1`; the coordinator starts a fresh response sequence.
    pub response_id: i64,
    /// Crate version of the agent.
    pub agent_version: String,
    /// Hash of every cache kind the agent holds, keyed by kind.
    pub cache_hashes: BTreeMap<String, String>,
}

/// Coordinator reply to a registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    /// Starting point of the response id sequence.
    pub response_id: i64,
    /// Recovery policy override.
    #[serde(default)]
    pub recovery_config: Option<Value>,
    /// Cache content the agent is missing.
    #[serde(default)]
    pub cluster_caches: Option<BTreeMap<String, CacheUpdate>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heartbeat_response_defaults() {
        let response: HeartbeatResponse = serde_json::from_value(json!({"responseId": 4})).unwrap();
        assert_eq!(response.response_id, 4);
        assert!(response.execution_commands.is_empty());
        assert!(!response.wants_registration());
        assert!(!response.restart_agent);
    }

    #[test]
    fn test_heartbeat_response_with_caches() {
        let response: HeartbeatResponse = serde_json::from_value(json!({
            "responseId": 5,
            "registrationCommand": {"command": "REGISTER"},
            "cancelCommands": [{"targetTaskId": 9, "reason": "user"}],
            "clusterCaches": {
                "topology": {"hash": "abc", "clusters": {"1": {"hosts": []}}}
            }
        }))
        .unwrap();
        assert!(response.wants_registration());
        assert_eq!(response.cancel_commands[0].target_task_id, 9);
        let caches = response.cluster_caches.unwrap();
        assert_eq!(caches["topology"].hash.as_deref(), Some("abc"));
    }
}
