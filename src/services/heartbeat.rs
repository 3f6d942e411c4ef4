//! Coordinator-facing send/receive cycle.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::config::HeartbeatConfig;
use crate::domain::models::heartbeat::{
    CacheUpdate, Heartbeat, HeartbeatResponse, NodeStatus, Registration,
};
use crate::domain::models::result::CommandResult;
use crate::domain::ports::CoordinatorClient;
use crate::infrastructure::cache::CacheFamily;
use crate::infrastructure::coordinator::HEARTBEAT_DESTINATION;
use crate::services::command_queue::CommandQueue;
use crate::services::recovery_engine::RecoveryPolicyEngine;
use crate::services::registration::RegistrationState;
use crate::services::status_outbox::StatusOutbox;

/// Timing of the heartbeat loop.
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    /// Gap between heartbeats when no command is queued or running.
    pub idle_interval: Duration,
    /// Gap while commands are queued or running.
    pub busy_interval: Duration,
    /// First retry delay after a failed exchange.
    pub initial_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_backoff: Duration,
    /// Reported on registration.
    pub agent_version: String,
}

impl From<&HeartbeatConfig> for HeartbeatSettings {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            idle_interval: Duration::from_secs(config.idle_interval_secs),
            busy_interval: Duration::from_secs(config.busy_interval_secs),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl HeartbeatSettings {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// What one exchange with the coordinator asked of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// Keep heartbeating.
    Continue,
    /// Register again before the next heartbeat.
    Reregister,
}

/// Registers with the coordinator and exchanges heartbeats with it.
pub struct HeartbeatLoop {
    client: Arc<dyn CoordinatorClient>,
    queue: Arc<CommandQueue>,
    caches: CacheFamily,
    outbox: Arc<StatusOutbox>,
    recovery: Arc<RecoveryPolicyEngine>,
    registration: Arc<RegistrationState>,
    hostname: String,
    settings: HeartbeatSettings,
    response_id: AtomicI64,
    /// Results drained for a heartbeat that never got through.
    undelivered: Mutex<Vec<CommandResult>>,
}

impl HeartbeatLoop {
    /// Loop over the given collaborators; nothing runs until [`Self::run`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn CoordinatorClient>,
        queue: Arc<CommandQueue>,
        caches: CacheFamily,
        outbox: Arc<StatusOutbox>,
        recovery: Arc<RecoveryPolicyEngine>,
        registration: Arc<RegistrationState>,
        hostname: String,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            client,
            queue,
            caches,
            outbox,
            recovery,
            registration,
            hostname,
            settings,
            response_id: AtomicI64::new(-1),
            undelivered: Mutex::new(Vec::new()),
        }
    }

    /// Id of the last response accepted, `-1` before registration.
    pub fn response_id(&self) -> i64 {
        self.response_id.load(Ordering::Acquire)
    }

    /// Register with the coordinator and adopt whatever state it returns.
    #[instrument(skip(self), fields(hostname = %self.hostname))]
    pub async fn register(&self) -> AgentResult<()> {
        self.registration.mark_unregistered();
        self.client.connect().await?;
        let registration = Registration {
            hostname: self.hostname.clone(),
            timestamp: Utc::now().timestamp_millis(),
            response_id: -1,
            agent_version: self.settings.agent_version.clone(),
            cache_hashes: self.caches.hashes(),
        };

        let mut response = self.client.register(&registration).await?;
        if let Some(caches) = response.cluster_caches.take() {
            self.apply_caches(caches).await;
        }
        if let Some(raw) = &response.recovery_config {
            self.recovery.apply_coordinator_config(raw);
        }

        self.response_id.store(response.response_id, Ordering::Release);
        let generation = self.registration.mark_registered();
        info!(response_id = response.response_id, generation, "registered with coordinator");
        Ok(())
    }

    fn build_heartbeat(&self) -> Heartbeat {
        let mut reports = std::mem::take(
            &mut *self.undelivered.lock().unwrap_or_else(PoisonError::into_inner),
        );
        reports.extend(self.queue.drain_results());

        Heartbeat {
            response_id: self.response_id(),
            timestamp: Utc::now().timestamp_millis(),
            hostname: self.hostname.clone(),
            node_status: NodeStatus::default(),
            component_status: self.outbox.drain(),
            reports,
            recovery_report: self.recovery.report(),
        }
    }

    /// Send one heartbeat and act on the response.
    ///
    /// Finished results and statuses that could not be delivered are kept
    /// for the next attempt.
    pub async fn heartbeat_once(&self) -> AgentResult<Exchange> {
        let heartbeat = self.build_heartbeat();
        let finished = heartbeat.reports.clone();
        let statuses = heartbeat.component_status.clone();

        let mut message = serde_json::to_value(&heartbeat)?;
        let in_progress = self.queue.in_progress_reports();
        if !in_progress.is_empty() {
            if let Some(reports) = message.get_mut("reports").and_then(|r| r.as_array_mut()) {
                for report in &in_progress {
                    reports.push(serde_json::to_value(report)?);
                }
            }
        }

        debug!(
            response_id = heartbeat.response_id,
            reports = finished.len(),
            in_progress = in_progress.len(),
            statuses = statuses.len(),
            "sending heartbeat"
        );

        let reply = match self.client.send(&message, HEARTBEAT_DESTINATION).await {
            Ok(reply) => reply,
            Err(err) => {
                let mut undelivered =
                    self.undelivered.lock().unwrap_or_else(PoisonError::into_inner);
                let mut kept = finished;
                kept.append(&mut undelivered);
                *undelivered = kept;
                drop(undelivered);
                self.outbox.restore(statuses);
                return Err(err);
            }
        };

        let response: HeartbeatResponse = serde_json::from_value(reply)
            .map_err(|e| AgentError::Protocol(format!("malformed heartbeat response: {e}")))?;
        Ok(self.apply_response(heartbeat.response_id, response).await)
    }

    async fn apply_response(&self, sent_id: i64, mut response: HeartbeatResponse) -> Exchange {
        if response.wants_registration() {
            info!("coordinator requested re-registration");
            self.registration.mark_unregistered();
            return Exchange::Reregister;
        }
        if response.restart_agent {
            warn!("coordinator requested an agent restart; re-registering");
            self.registration.mark_unregistered();
            return Exchange::Reregister;
        }
        if response.response_id != sent_id + 1 {
            warn!(
                expected = sent_id + 1,
                received = response.response_id,
                "heartbeat response id out of sequence, re-registering"
            );
            self.registration.mark_unregistered();
            return Exchange::Reregister;
        }
        self.response_id.store(response.response_id, Ordering::Release);

        // Caches land before any command that may be built from them.
        if let Some(caches) = response.cluster_caches.take() {
            self.apply_caches(caches).await;
        }
        if let Some(raw) = &response.recovery_config {
            self.recovery.apply_coordinator_config(raw);
        }
        for cancel in &response.cancel_commands {
            if !self.queue.cancel(cancel.target_task_id, &cancel.reason) {
                debug!(task_id = cancel.target_task_id, "nothing to cancel");
            }
        }
        for raw in response.execution_commands {
            // Invalid commands are answered with a FAILED result by the queue.
            let _ = self.queue.put_wire(raw);
        }
        Exchange::Continue
    }

    /// Rewrite the caches on the blocking pool; persisting fsyncs under a
    /// file lock.
    async fn apply_caches(&self, updates: BTreeMap<String, CacheUpdate>) {
        let caches = self.caches.clone();
        let applied = tokio::task::spawn_blocking(move || caches.apply_update(&updates)).await;
        match applied {
            Ok(Ok(applied)) => {
                for (kind, delta) in applied {
                    debug!(
                        %kind,
                        added = delta.added.len(),
                        removed = delta.removed.len(),
                        changed = delta.changed.len(),
                        "cache updated"
                    );
                }
            }
            Ok(Err(err)) => warn!(error = %err, "cache update only partially persisted"),
            Err(err) => error!(error = %err, "cache update task failed"),
        }
    }

    fn cadence(&self) -> Duration {
        if self.queue.is_busy() {
            self.settings.busy_interval
        } else {
            self.settings.idle_interval
        }
    }

    /// Register, then heartbeat until `stop` fires. Failed exchanges back off
    /// exponentially; anything but a connectivity failure also drops the
    /// registration.
    pub async fn run(&self, stop: CancellationToken) {
        info!(hostname = %self.hostname, "heartbeat loop started");
        let mut backoff = self.settings.backoff();

        loop {
            if stop.is_cancelled() {
                break;
            }
            let outcome = if self.registration.is_registered() {
                self.heartbeat_once().await
            } else {
                self.register().await.map(|()| Exchange::Continue)
            };

            let wait = match outcome {
                Ok(Exchange::Continue) => {
                    backoff.reset();
                    self.cadence()
                }
                Ok(Exchange::Reregister) => {
                    backoff.reset();
                    Duration::ZERO
                }
                Err(err) => {
                    let delay = backoff.next_backoff().unwrap_or(self.settings.max_backoff);
                    if err.is_transient() {
                        warn!(error = %err, retry_in_ms = delay.as_millis(), "coordinator unreachable");
                    } else {
                        warn!(error = %err, retry_in_ms = delay.as_millis(), "coordinator exchange failed, re-registering");
                        self.registration.mark_unregistered();
                    }
                    delay
                }
            };

            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }
        info!("heartbeat loop stopped");
    }
}
