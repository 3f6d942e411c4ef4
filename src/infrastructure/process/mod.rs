//! Subprocess supervision

pub mod watchdog;

pub use watchdog::{ProcessSpec, ProcessWatchdog, RawOutcome, WatchdogSettings};
