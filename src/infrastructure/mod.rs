//! Infrastructure layer: adapters for the filesystem, processes, the
//! coordinator transport, configuration and logging.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod process;
