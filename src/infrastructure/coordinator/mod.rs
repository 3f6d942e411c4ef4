//! Coordinator transport adapters

pub mod http_client;

pub use http_client::{HttpCoordinatorClient, HEARTBEAT_DESTINATION, REGISTER_DESTINATION};
