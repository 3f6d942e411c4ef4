//! Seam to the coordinator's registration and heartbeat endpoints.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::AgentResult;
use crate::domain::models::{Registration, RegistrationResponse};

/// Transport to the coordinator.
///
/// Connectivity failures surface as [`AgentError::Connectivity`] so callers
/// can retry them; anything else is a protocol error.
///
/// [`AgentError::Connectivity`]: crate::domain::errors::AgentError::Connectivity
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Check that the coordinator is reachable.
    async fn connect(&self) -> AgentResult<()>;

    /// Register this host; the reply seeds the response id sequence.
    async fn register(&self, registration: &Registration) -> AgentResult<RegistrationResponse>;

    /// Send a JSON message to a named destination and return the reply.
    async fn send(&self, message: &Value, destination: &str) -> AgentResult<Value>;
}
