//! Registration state shared by the heartbeat loop and the status poller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Whether the agent is currently registered with the coordinator.
///
/// The generation is bumped on every successful registration so that
/// consumers can tell a re-registration apart from a continuing session.
#[derive(Debug, Default)]
pub struct RegistrationState {
    registered: AtomicBool,
    generation: AtomicU64,
}

impl RegistrationState {
    /// Unregistered, generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the last registration still holds.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Number of successful registrations so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Record a successful registration; returns the new generation.
    pub fn mark_registered(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.registered.store(true, Ordering::Release);
        generation
    }

    /// Forget the registration; the heartbeat loop registers again.
    pub fn mark_unregistered(&self) {
        self.registered.store(false, Ordering::Release);
    }
}
