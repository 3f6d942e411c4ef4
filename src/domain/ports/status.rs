//! Seams used by the status poller.

use async_trait::async_trait;

use crate::domain::errors::AgentResult;
use crate::domain::models::{Command, ComponentState, ComponentStatus};

/// Determines the live state of a component by running a status command.
#[async_trait]
pub trait StatusCheck: Send + Sync {
    /// Current state of the component `cmd` checks.
    async fn check(&self, cmd: &Command) -> AgentResult<ComponentState>;
}

/// Receives batches of changed statuses for delivery to the coordinator.
pub trait StatusReporter: Send + Sync {
    /// Queue `batch` for delivery.
    fn report(&self, batch: Vec<ComponentStatus>);
}

/// Receives every status observation, changed or not.
pub trait StatusObserver: Send + Sync {
    /// Look at one observation.
    fn observe(&self, status: &ComponentStatus);
}
