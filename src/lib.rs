//! Fleet Agent - host agent for a cluster management coordinator
//!
//! The agent registers its host with the coordinator, keeps a local mirror
//! of cluster state, executes the commands it is sent, reports component
//! status and restarts failed components within a bounded retry policy.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Commands, results, status and recovery models
//! - **Application Layer** (`application`): Wiring and process lifecycle
//! - **Service Layer** (`services`): Queue, orchestration, polling, recovery, heartbeat
//! - **Infrastructure Layer** (`infrastructure`): Caches, processes, HTTP, config, logging
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use fleet_agent::{Agent, ConfigLoader, StopSignal};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load(None)?;
//!     let stop = StopSignal::new();
//!     stop.install_signal_handlers();
//!     Agent::from_config(&config, stop)?.run().await
//! }
//! ```

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{Agent, StopSignal};
pub use domain::models::{
    Command, CommandResult, CommandStatus, ComponentState, ComponentStatus, Config, RecoveryConfig,
    RecoveryMode, RoleCommand,
};
pub use domain::ports::{CommandExecutor, CoordinatorClient, StatusCheck, StatusReporter};
pub use domain::{AgentError, AgentResult};
pub use infrastructure::cache::{CacheFamily, CacheKind, ClusterCache};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CommandFactory, CommandQueue, HeartbeatLoop, RecoveryPolicyEngine, ServiceOrchestrator,
    StatusPoller,
};
