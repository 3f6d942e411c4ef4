//! Domain errors for the fleet agent.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while the agent ingests, executes, or reports work.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The resolved script path is not a file.
    #[error("Script {} does not exist", .0.display())]
    ScriptNotFound(PathBuf),

    /// `script_type` names no supported interpreter.
    #[error("Unknown script type {0}")]
    UnknownScriptType(String),

    /// The script ran past its timeout; carries the timeout in seconds.
    #[error("Command timed out after {0} seconds")]
    ExecutionTimeout(u64),

    /// The interpreter could not be started.
    #[error("Failed to spawn {program}: {reason}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// OS error text.
        reason: String,
    },

    /// A coordinator command failed validation.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Compressed `clusterHostInfo` could not be expanded.
    #[error("Broken data in clusterHostInfo: {0}")]
    MalformedHostInfo(String),

    /// A persisted file does not parse.
    #[error("Cache file {} is corrupt: {reason}", path.display())]
    CacheCorruption {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser error text.
        reason: String,
    },

    /// The coordinator could not be reached; retried with backoff.
    #[error("Coordinator unreachable: {0}")]
    Connectivity(String),

    /// The coordinator answered with something the agent cannot use.
    #[error("Coordinator protocol error: {0}")]
    Protocol(String),

    /// Filesystem or process I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Agent settings are unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An executor could not run a command.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result alias used throughout the agent.
pub type AgentResult<T> = Result<T, AgentError>;

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl AgentError {
    /// Whether the error is a transient coordinator failure worth retrying.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}
