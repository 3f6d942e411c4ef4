//! Common test utilities for integration tests
//!
//! Scripted stand-ins for the coordinator, the executor and the status
//! check, plus topology builders shared by the test files.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_agent::domain::models::heartbeat::{Registration, RegistrationResponse};
use fleet_agent::{
    AgentError, AgentResult, Command, CommandExecutor, CommandResult, ComponentState,
    CoordinatorClient, StatusCheck,
};

/// Setup test logging
#[allow(dead_code)]
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `predicate` every 20ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

/// Topology of a single host `node1` carrying `components` of HDFS.
pub fn topology(components: &[&str]) -> Value {
    let components: Vec<Value> = components
        .iter()
        .map(|name| {
            json!({
                "serviceName": "HDFS",
                "componentName": name,
                "hostIds": [0],
                "statusCommandsToRun": ["STATUS"]
            })
        })
        .collect();
    json!({"hosts": [{"hostId": 0, "hostName": "node1"}], "components": components})
}

/// Wire form of an execution command.
pub fn wire_command(task_id: u64, role: &str, role_command: &str) -> Value {
    json!({
        "commandId": format!("1-{task_id}"),
        "taskId": task_id,
        "clusterId": "1",
        "hostname": "node1",
        "role": role,
        "roleCommand": role_command,
        "serviceName": "HDFS",
        "hostLevelParams": {},
        "configurations": {},
        "commandParams": {
            "script": "scripts/datanode.py",
            "script_type": "PYTHON",
            "command_timeout": 30
        }
    })
}

/// Executor that succeeds unless the role is listed as failing. Records
/// every command it ran.
#[derive(Default)]
pub struct RecordingExecutor {
    pub failing_roles: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<Command>>,
}

impl RecordingExecutor {
    pub fn fail_role(&self, role: &str) {
        self.failing_roles.lock().unwrap().push(role.to_string());
    }

    pub fn executed(&self) -> Vec<Command> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, cmd: &Command) -> AgentResult<CommandResult> {
        self.executed.lock().unwrap().push(cmd.clone());
        let failing = self.failing_roles.lock().unwrap().contains(&cmd.role);
        let exit_code = i32::from(failing);
        Ok(CommandResult::from_exit(cmd, exit_code, "ran".into(), String::new()))
    }

    fn cancel(&self, _task_id: u64, _reason: &str) -> bool {
        false
    }
}

/// Check answering from a table; unknown components are STARTED.
#[derive(Default)]
pub struct TableCheck {
    states: Mutex<HashMap<String, ComponentState>>,
}

impl TableCheck {
    pub fn set(&self, component: &str, state: ComponentState) {
        self.states.lock().unwrap().insert(component.to_string(), state);
    }
}

#[async_trait]
impl StatusCheck for TableCheck {
    async fn check(&self, cmd: &Command) -> AgentResult<ComponentState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(cmd.component())
            .copied()
            .unwrap_or(ComponentState::Started))
    }
}

/// Coordinator that answers registrations from a template and replays
/// scripted heartbeat replies. Unscripted heartbeats are acknowledged.
#[derive(Default)]
pub struct FakeCoordinator {
    pub registration_reply: Mutex<RegistrationResponse>,
    pub replies: Mutex<VecDeque<AgentResult<Value>>>,
    pub registrations: Mutex<Vec<Registration>>,
    pub heartbeats: Mutex<Vec<Value>>,
}

impl FakeCoordinator {
    pub fn with_registration(reply: RegistrationResponse) -> Arc<Self> {
        Arc::new(Self {
            registration_reply: Mutex::new(reply),
            ..Self::default()
        })
    }

    pub fn reply(&self, reply: AgentResult<Value>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn heartbeats(&self) -> Vec<Value> {
        self.heartbeats.lock().unwrap().clone()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }
}

#[async_trait]
impl CoordinatorClient for FakeCoordinator {
    async fn connect(&self) -> AgentResult<()> {
        Ok(())
    }

    async fn register(&self, registration: &Registration) -> AgentResult<RegistrationResponse> {
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(self.registration_reply.lock().unwrap().clone())
    }

    async fn send(&self, message: &Value, _destination: &str) -> AgentResult<Value> {
        self.heartbeats.lock().unwrap().push(message.clone());
        let sent_id = message["responseId"].as_i64().unwrap_or(-1);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"responseId": sent_id + 1})))
    }
}

/// Coordinator that is never reachable.
pub struct DownCoordinator;

#[async_trait]
impl CoordinatorClient for DownCoordinator {
    async fn connect(&self) -> AgentResult<()> {
        Err(AgentError::Connectivity("connection refused".into()))
    }

    async fn register(&self, _registration: &Registration) -> AgentResult<RegistrationResponse> {
        Err(AgentError::Connectivity("connection refused".into()))
    }

    async fn send(&self, _message: &Value, _destination: &str) -> AgentResult<Value> {
        Err(AgentError::Connectivity("connection refused".into()))
    }
}
