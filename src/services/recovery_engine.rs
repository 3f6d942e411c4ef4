//! Autonomous component recovery.
//!
//! The engine tracks, per component, the state the coordinator wants
//! (desired) and the state last observed (current). When they disagree and
//! the recovery mode allows it, a recovery command is queued, subject to a
//! sliding-window attempt limit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::AgentResult;
use crate::domain::models::command::{Command, CommandType, RoleCommand};
use crate::domain::models::recovery::{
    ComponentRecoveryReport, PolicyState, RecoveryAction, RecoveryConfig, RecoveryDecision,
    RecoveryMode, RecoveryPhase, RecoveryReport, RecoveryState,
};
use crate::domain::models::result::{CommandResult, CommandStatus};
use crate::domain::models::status::{ComponentState, ComponentStatus};
use crate::domain::ports::StatusObserver;
use crate::infrastructure::cache::cluster_cache::write_atomic;
use crate::infrastructure::cache::{CacheDelta, CacheSnapshot};
use crate::infrastructure::cache::path_lock;
use crate::services::command_factory::CommandFactory;
use crate::services::command_queue::{CommandQueue, ExecutionEvent};

/// File the engine persists its counters to, inside the cache directory.
pub const RECOVERY_FILE: &str = "recovery.json";

/// Action that moves a component from `current` towards `desired`.
///
/// In `FULL` mode a component already in its desired state is still
/// recovered when its configuration is stale: reinstalled when it should be
/// INSTALLED, restarted when it should be STARTED.
pub fn required_command(
    mode: RecoveryMode,
    desired: ComponentState,
    current: ComponentState,
    stale_config: bool,
) -> Option<RecoveryAction> {
    use ComponentState::{Init, InstallFailed, Installed, Started};

    match (mode, desired, current) {
        (RecoveryMode::Disabled, _, _) => None,
        (_, Started, Installed) => Some(RecoveryAction::Start),
        (RecoveryMode::AutoInstallStart | RecoveryMode::Full, Started | Installed, InstallFailed) => {
            Some(RecoveryAction::Install)
        }
        (RecoveryMode::Full, Started | Installed, Init) => Some(RecoveryAction::Install),
        (RecoveryMode::Full, Installed, Started) => Some(RecoveryAction::Stop),
        (RecoveryMode::Full, Installed, Installed) if stale_config => Some(RecoveryAction::Install),
        (RecoveryMode::Full, Started, Started) if stale_config => Some(RecoveryAction::Restart),
        _ => None,
    }
}

fn desired_after(cmd: &Command) -> Option<ComponentState> {
    match cmd.role_command {
        RoleCommand::Install | RoleCommand::Stop => Some(ComponentState::Installed),
        RoleCommand::Start => Some(ComponentState::Started),
        RoleCommand::CustomCommand if cmd.custom_command().as_deref() == Some("RESTART") => {
            Some(ComponentState::Started)
        }
        _ => None,
    }
}

fn current_after(cmd: &Command, result: &CommandResult) -> Option<ComponentState> {
    match (result.status, &cmd.role_command) {
        (CommandStatus::Completed, RoleCommand::Start) => Some(ComponentState::Started),
        (CommandStatus::Completed, RoleCommand::Install | RoleCommand::Stop) => {
            Some(ComponentState::Installed)
        }
        (CommandStatus::Completed, RoleCommand::CustomCommand)
            if cmd.custom_command().as_deref() == Some("RESTART") =>
        {
            Some(ComponentState::Started)
        }
        (CommandStatus::Failed, RoleCommand::Install) => Some(ComponentState::InstallFailed),
        _ => None,
    }
}

fn phase_of(state: &RecoveryState) -> RecoveryPhase {
    match (state.desired, state.current) {
        (Some(ComponentState::Started), Some(ComponentState::Started)) if state.stale_config => {
            RecoveryPhase::NeedsRestart
        }
        (Some(ComponentState::Started), Some(ComponentState::Started)) => RecoveryPhase::Started,
        (Some(ComponentState::Started), Some(_)) => RecoveryPhase::NeedsRestart,
        _ => RecoveryPhase::Installed,
    }
}

/// Decides which components to recover and queues the commands that do it.
pub struct RecoveryPolicyEngine {
    config: RwLock<RecoveryConfig>,
    states: Mutex<BTreeMap<String, RecoveryState>>,
    queue: Arc<CommandQueue>,
    factory: Arc<CommandFactory>,
    path: PathBuf,
    next_task_id: AtomicU64,
    interval: Duration,
}

impl RecoveryPolicyEngine {
    /// Create the engine and reload persisted counters from `cache_dir`.
    pub fn new(
        config: RecoveryConfig,
        queue: Arc<CommandQueue>,
        factory: Arc<CommandFactory>,
        cache_dir: &Path,
        interval: Duration,
    ) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(reason) => {
                warn!(%reason, "invalid recovery settings, recovery disabled");
                RecoveryConfig {
                    mode: RecoveryMode::Disabled,
                    ..config
                }
            }
        };
        let path = cache_dir.join(RECOVERY_FILE);
        let states = load_states(&path);
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();

        Self {
            config: RwLock::new(config),
            states: Mutex::new(states),
            queue,
            factory,
            path,
            next_task_id: AtomicU64::new(seed),
            interval,
        }
    }

    /// Policy currently in force.
    pub fn config(&self) -> RecoveryConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply a coordinator-supplied `recoveryConfig`.
    ///
    /// Invalid input disables recovery rather than keeping stale settings.
    pub fn apply_coordinator_config(&self, raw: &Value) {
        let merged = self.config().merged_with_coordinator(raw);
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        match merged {
            Ok(merged) => {
                info!(mode = ?merged.mode, components = merged.enabled_components.len(), "recovery configuration updated");
                *config = merged;
            }
            Err(reason) => {
                warn!(%reason, "invalid recovery configuration from coordinator, recovery disabled");
                config.mode = RecoveryMode::Disabled;
            }
        }
        drop(config);

        let desired = RecoveryConfig::desired_states(raw);
        if !desired.is_empty() {
            let mut states = self.lock_states();
            for (component, state) in desired {
                let entry = states.entry(component).or_default();
                entry.desired = Some(state);
                entry.phase = phase_of(entry);
            }
        }
    }

    /// Bookkeeping of one component, if any exists.
    pub fn state(&self, component: &str) -> Option<RecoveryState> {
        self.lock_states().get(&component.to_uppercase()).cloned()
    }

    /// Gate one recovery attempt through the window policy.
    pub fn record_failure(&self, component: &str) -> RecoveryDecision {
        self.record_failure_at(component, Utc::now())
    }

    /// [`Self::record_failure`] at a given time.
    pub fn record_failure_at(&self, component: &str, now: DateTime<Utc>) -> RecoveryDecision {
        let config = self.config();
        let window = ChronoDuration::minutes(i64::from(config.window_in_minutes));
        let retry_gap = ChronoDuration::minutes(i64::from(config.retry_gap));
        let key = component.to_uppercase();

        let decision = {
            let mut states = self.lock_states();
            let state = states.entry(key.clone()).or_default();
            state.failure_timestamps.retain(|t| now - *t < window);

            if state.last_action_time.is_some_and(|last| now - last < retry_gap) {
                state.policy = PolicyState::Cooldown;
                RecoveryDecision::Cooldown
            } else if state.failure_timestamps.len() < config.max_count as usize
                && state.lifetime_count < config.max_lifetime_count
            {
                state.failure_timestamps.push(now);
                state.last_action_time = Some(now);
                state.lifetime_count += 1;
                state.policy = PolicyState::Healthy;
                state.warned = false;
                RecoveryDecision::Allowed
            } else {
                state.policy = PolicyState::Exhausted;
                if !state.warned {
                    state.warned = true;
                    warn!(
                        component = %key,
                        in_window = state.failure_timestamps.len(),
                        lifetime = state.lifetime_count,
                        "recovery attempts exhausted"
                    );
                }
                RecoveryDecision::Exhausted
            }
        };

        if decision.is_allowed() {
            if let Err(err) = self.persist() {
                warn!(error = %err, "failed to persist recovery counters");
            }
        }
        decision
    }

    /// Queue recovery commands for every component that needs one.
    pub fn evaluate(&self) -> usize {
        self.evaluate_at(Utc::now())
    }

    /// [`Self::evaluate`] at a given time.
    pub fn evaluate_at(&self, now: DateTime<Utc>) -> usize {
        let config = self.config();
        if !config.mode.is_enabled() {
            return 0;
        }
        if self.queue.is_busy() {
            debug!("commands pending, recovery paused");
            return 0;
        }

        let mut queued = 0;
        for component in self.factory.all_host_components() {
            if !config.covers(&component.component_name) {
                continue;
            }
            let Some(state) = self.state(&component.component_name) else {
                continue;
            };
            let (Some(desired), Some(current)) = (state.desired, state.current) else {
                continue;
            };
            let Some(action) = required_command(config.mode, desired, current, state.stale_config)
            else {
                continue;
            };

            match self.record_failure_at(&component.component_name, now) {
                RecoveryDecision::Allowed => {
                    let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                    let cmd = self.factory.recovery_command(&component, action, task_id);
                    info!(
                        component = %component.component_name,
                        ?action,
                        task_id,
                        %desired,
                        %current,
                        "queueing recovery command"
                    );
                    self.queue.put(cmd);
                    queued += 1;
                }
                decision => {
                    debug!(component = %component.component_name, ?decision, "recovery denied");
                }
            }
        }
        queued
    }

    /// Track desired and current state from commands passing through the queue.
    pub fn handle_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Queued(cmd) if cmd.command_type == CommandType::ExecutionCommand => {
                if let Some(desired) = desired_after(cmd) {
                    self.update(cmd.component(), |state| state.desired = Some(desired));
                }
            }
            ExecutionEvent::Finished { command, result } if !command.is_status() => {
                if let Some(current) = current_after(command, result) {
                    let applies_config =
                        result.is_success() && command.role_command != RoleCommand::Stop;
                    self.update(command.component(), |state| {
                        state.current = Some(current);
                        if applies_config {
                            state.stale_config = false;
                        }
                    });
                }
            }
            _ => {}
        }
    }

    /// Record whether `component` runs with outdated configuration.
    pub fn mark_config_stale(&self, component: &str, stale: bool) {
        self.update(component, |state| state.stale_config = stale);
    }

    /// Mark every local component of a cluster whose configuration changed
    /// as stale. A cluster's first configuration marks nothing.
    pub fn configurations_changed(&self, delta: &CacheDelta) {
        for cluster_id in &delta.changed {
            for component in self.factory.host_components(cluster_id) {
                debug!(component = %component.component_name, cluster_id, "configuration is now stale");
                self.mark_config_stale(&component.component_name, true);
            }
        }
    }

    /// Follow rewrites of the configuration cache. The cache only holds a
    /// weak handle, so it never keeps the engine alive.
    pub fn track_configuration_changes(self: &Arc<Self>) {
        let engine: Weak<Self> = Arc::downgrade(self);
        self.factory.caches().configurations.on_update(Arc::new(
            move |delta: &CacheDelta, _: &CacheSnapshot| {
                if let Some(engine) = engine.upgrade() {
                    engine.configurations_changed(delta);
                }
            },
        ));
    }

    fn update(&self, component: &str, apply: impl FnOnce(&mut RecoveryState)) {
        let mut states = self.lock_states();
        let state = states.entry(component.to_uppercase()).or_default();
        apply(state);
        state.phase = phase_of(state);
    }

    /// Attempt counts for the heartbeat.
    pub fn report(&self) -> RecoveryReport {
        let config = self.config();
        if !config.mode.is_enabled() {
            return RecoveryReport::disabled();
        }
        let states = self.lock_states();
        let reports = config
            .enabled_components
            .iter()
            .map(|name| {
                let lifetime = states.get(name).map_or(0, |s| s.lifetime_count);
                ComponentRecoveryReport {
                    name: name.clone(),
                    num_attempts: lifetime,
                    limit_reached: lifetime >= config.max_lifetime_count,
                }
            })
            .collect();
        RecoveryReport::from_components(reports)
    }

    /// Write every component's counters to disk.
    pub fn persist(&self) -> AgentResult<()> {
        let body = {
            let states = self.lock_states();
            serde_json::to_vec_pretty(&*states)?
        };
        let lock = path_lock::lock_for(&self.path);
        let _guard = path_lock::acquire(&lock);
        write_atomic(&self.path, &body)
    }

    /// Evaluate on every tick and follow queue events until `stop` fires.
    pub async fn run(&self, stop: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "recovery engine started");
        let mut events = self.queue.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "recovery engine fell behind on execution events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    self.evaluate();
                }
            }
        }

        if let Err(err) = self.persist() {
            warn!(error = %err, "failed to persist recovery counters on shutdown");
        }
        info!("recovery engine stopped");
    }

    fn lock_states(&self) -> MutexGuard<'_, BTreeMap<String, RecoveryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatusObserver for RecoveryPolicyEngine {
    fn observe(&self, status: &ComponentStatus) {
        self.update(&status.component_name, |state| {
            // A non-live observation does not hide a failed install.
            if status.status == ComponentState::Started
                || state.current != Some(ComponentState::InstallFailed)
            {
                state.current = Some(status.status);
            }
        });
    }
}

fn load_states(path: &Path) -> BTreeMap<String, RecoveryState> {
    let lock = path_lock::lock_for(path);
    let _guard = path_lock::acquire(&lock);
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read recovery counters");
            return BTreeMap::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(states) => states,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding corrupt recovery counters");
            BTreeMap::new()
        }
    }
}
