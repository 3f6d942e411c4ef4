//! Seam between the command queue and whatever runs scripts.

use async_trait::async_trait;

use crate::domain::errors::AgentResult;
use crate::domain::models::{Command, CommandResult};

/// Runs one command to completion.
///
/// An `Err` means the command could not be executed at all; the caller
/// turns it into a FAILED result. A script that ran and failed is an
/// `Ok` result with status FAILED.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` and report its outcome.
    async fn execute(&self, cmd: &Command) -> AgentResult<CommandResult>;

    /// Abort the running command with `task_id`. Returns whether a running
    /// command was found.
    fn cancel(&self, task_id: u64, reason: &str) -> bool;
}
