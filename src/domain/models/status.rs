//! Component states and the status reports built from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Observed or desired state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    /// No status seen yet.
    Init,
    /// Installed and not running.
    Installed,
    /// Running.
    Started,
    /// Last install attempt failed.
    InstallFailed,
    /// Status could not be determined.
    Unknown,
}

impl ComponentState {
    /// Wire spelling.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Installed => "INSTALLED",
            Self::Started => "STARTED",
            Self::InstallFailed => "INSTALL_FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status observation, as reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Cluster of the component.
    pub cluster_id: String,
    /// Service of the component.
    pub service_name: String,
    /// Component name.
    pub component_name: String,
    /// Status command that produced the observation.
    pub command: String,
    /// Observed state.
    pub status: ComponentState,
}

/// Identity under which statuses are deduplicated.
pub type StatusKey = (String, String, String);

impl ComponentStatus {
    /// Deduplication key: cluster, component, status command.
    pub fn key(&self) -> StatusKey {
        (
            self.cluster_id.clone(),
            self.component_name.clone(),
            self.command.clone(),
        )
    }
}
