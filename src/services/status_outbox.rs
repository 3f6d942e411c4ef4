//! Component statuses waiting for the next heartbeat.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::domain::models::status::{ComponentStatus, StatusKey};
use crate::domain::ports::StatusReporter;

/// Holds reported statuses until the next heartbeat picks them up.
///
/// A newer status for the same (cluster, component, command) replaces an
/// undelivered older one.
#[derive(Debug, Default)]
pub struct StatusOutbox {
    pending: Mutex<Vec<ComponentStatus>>,
}

impl StatusOutbox {
    /// Empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything pending.
    pub fn drain(&self) -> Vec<ComponentStatus> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Put back statuses whose delivery failed. Anything reported since
    /// takes precedence.
    pub fn restore(&self, undelivered: Vec<ComponentStatus>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let newer: Vec<StatusKey> = pending.iter().map(ComponentStatus::key).collect();
        let mut merged: Vec<ComponentStatus> = undelivered
            .into_iter()
            .filter(|s| !newer.contains(&s.key()))
            .collect();
        merged.append(&mut pending);
        *pending = merged;
    }

    /// Number of pending statuses.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatusReporter for StatusOutbox {
    fn report(&self, batch: Vec<ComponentStatus>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut index: HashMap<StatusKey, usize> = pending
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key(), i))
            .collect();
        for status in batch {
            match index.get(&status.key()) {
                Some(&i) => pending[i] = status,
                None => {
                    index.insert(status.key(), pending.len());
                    pending.push(status);
                }
            }
        }
    }
}
