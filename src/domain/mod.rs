//! Domain layer for the fleet agent
//!
//! Commands, results, component status, recovery policy types and the
//! ports that infrastructure adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{AgentError, AgentResult};
