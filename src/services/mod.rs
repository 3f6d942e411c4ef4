//! Agent services: command execution, status collection, recovery and the
//! coordinator exchange.

pub mod cluster_host_info;
pub mod command_factory;
pub mod command_queue;
pub mod heartbeat;
pub mod orchestrator;
pub mod output_window;
pub mod recovery_engine;
pub mod registration;
pub mod status_outbox;
pub mod status_poller;

pub use command_factory::{CommandFactory, HostComponent};
pub use command_queue::{CommandQueue, ExecutionEvent};
pub use heartbeat::{Exchange, HeartbeatLoop, HeartbeatSettings};
pub use orchestrator::{OrchestratorSettings, ServiceOrchestrator};
pub use output_window::OutputWindow;
pub use recovery_engine::{required_command, RecoveryPolicyEngine};
pub use registration::RegistrationState;
pub use status_outbox::StatusOutbox;
pub use status_poller::{OrchestratorStatusCheck, StatusPoller};
