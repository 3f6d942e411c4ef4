//! Port trait definitions (Hexagonal Architecture)
//!
//! - `CommandExecutor`: runs one command to completion
//! - `CoordinatorClient`: transport to the coordinator
//! - `StatusCheck`, `StatusReporter`, `StatusObserver`: status polling seams

pub mod command_executor;
pub mod coordinator_client;
pub mod status;

pub use command_executor::CommandExecutor;
pub use coordinator_client::CoordinatorClient;
pub use status::{StatusObserver, StatusCheck, StatusReporter};
