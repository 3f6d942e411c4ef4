//! Application layer: wiring and process lifecycle.

pub mod agent;
pub mod shutdown;

pub use agent::{resolve_hostname, Agent};
pub use shutdown::StopSignal;
