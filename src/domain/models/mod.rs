//! Value types shared by every layer.

pub mod command;
pub mod config;
pub mod heartbeat;
pub mod recovery;
pub mod result;
pub mod status;

pub use command::{Command, CommandParams, CommandType, JsonMap, RoleCommand, ScriptType};
pub use config::{
    Config, CoordinatorConfig, ExecutionConfig, HeartbeatConfig, LoggingConfig, PathsConfig,
    RecoverySettings, StatusConfig,
};
pub use heartbeat::{
    CacheUpdate, CancelCommand, Heartbeat, HeartbeatResponse, NodeStatus, Registration,
    RegistrationResponse,
};
pub use recovery::{
    ComponentRecoveryReport, PolicyState, RecoveryAction, RecoveryConfig, RecoveryDecision, RecoveryMode,
    RecoveryPhase, RecoveryReport, RecoveryState, RecoverySummary,
};
pub use result::{CommandResult, CommandStatus};
pub use status::{ComponentState, ComponentStatus, StatusKey};
