//! FIFO command queue with a single worker.
//!
//! Every command the worker dequeues produces exactly one result, including
//! when the executor returns an error or panics.

use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::AgentResult;
use crate::domain::models::command::Command;
use crate::domain::models::result::CommandResult;
use crate::domain::ports::CommandExecutor;

const EVENT_CAPACITY: usize = 256;

/// Cancel reason given to a command interrupted by agent shutdown.
pub const STOP_REASON: &str = "agent stopping";

/// Lifecycle notifications for commands passing through the queue.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A command entered the queue.
    Queued(Arc<Command>),
    /// A command left the worker with its result.
    Finished {
        /// The command that ran.
        command: Arc<Command>,
        /// What it produced.
        result: CommandResult,
    },
}

/// FIFO of commands run one at a time by a single worker.
///
/// Finished results are kept until the heartbeat drains them.
pub struct CommandQueue {
    executor: Arc<dyn CommandExecutor>,
    pending: Mutex<VecDeque<Arc<Command>>>,
    results: Mutex<Vec<CommandResult>>,
    in_flight: Mutex<Option<Arc<Command>>>,
    wakeup: Notify,
    events: broadcast::Sender<ExecutionEvent>,
    idle_wait: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandQueue {
    /// Empty queue; the worker wakes at least every `idle_wait`.
    pub fn new(executor: Arc<dyn CommandExecutor>, idle_wait: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            executor,
            pending: Mutex::new(VecDeque::new()),
            results: Mutex::new(Vec::new()),
            in_flight: Mutex::new(None),
            wakeup: Notify::new(),
            events,
            idle_wait,
        }
    }

    /// Append a validated command and wake the worker.
    pub fn put(&self, cmd: Command) {
        let cmd = Arc::new(cmd);
        debug!(task_id = cmd.task_id, role = %cmd.role, command = %cmd.command_name(), "command queued");
        lock(&self.pending).push_back(Arc::clone(&cmd));
        self.wakeup.notify_one();
        // No subscribers is fine.
        let _ = self.events.send(ExecutionEvent::Queued(cmd));
    }

    /// Validate a raw coordinator command and queue it.
    ///
    /// A command that fails validation is not queued; when its ids can be
    /// recovered a FAILED result is recorded so the coordinator hears back.
    pub fn put_wire(&self, raw: Value) -> AgentResult<()> {
        match Command::from_wire(raw.clone()) {
            Ok(cmd) => {
                self.put(cmd);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "rejecting invalid command");
                if let Some((action_id, task_id)) = Command::salvage_ids(&raw) {
                    lock(&self.results).push(CommandResult::rejected(
                        action_id,
                        task_id,
                        err.to_string(),
                    ));
                }
                Err(err)
            }
        }
    }

    /// Abort a queued or running command.
    pub fn cancel(&self, task_id: u64, reason: &str) -> bool {
        let removed = {
            let mut pending = lock(&self.pending);
            pending
                .iter()
                .position(|c| c.task_id == task_id)
                .and_then(|idx| pending.remove(idx))
        };
        if let Some(cmd) = removed {
            info!(task_id, reason, "dropping queued command");
            let result =
                CommandResult::failed(&cmd, format!("Command aborted. Reason: '{reason}'"));
            self.finish(cmd, result);
            return true;
        }
        self.executor.cancel(task_id, reason)
    }

    /// Worker loop: drain the queue until `stop` fires.
    ///
    /// A command still running when `stop` fires is cancelled through the
    /// executor and awaited, so its process group is gone and its FAILED
    /// result is recorded before the worker returns.
    pub async fn run(&self, stop: CancellationToken) {
        info!("command queue worker started");
        loop {
            while !stop.is_cancelled() && self.process_next(Some(&stop)).await {}
            if stop.is_cancelled() {
                break;
            }
            tokio::select! {
                () = stop.cancelled() => break,
                () = self.wakeup.notified() => {}
                () = tokio::time::sleep(self.idle_wait) => {}
            }
        }
        info!("command queue worker stopped");
    }

    /// Execute everything currently pending. Returns how many commands ran.
    pub async fn process_pending(&self) -> usize {
        let mut processed = 0;
        while self.process_next(None).await {
            processed += 1;
        }
        processed
    }

    async fn process_next(&self, stop: Option<&CancellationToken>) -> bool {
        let Some(cmd) = ({
            let mut pending = lock(&self.pending);
            let next = pending.pop_front();
            if next.is_some() {
                // Set while still holding the pending lock so the command is
                // never invisible to is_idle/has_in_flight.
                lock(&self.in_flight).clone_from(&next);
            }
            next
        }) else {
            return false;
        };

        let outcome = {
            let execution = AssertUnwindSafe(self.executor.execute(&cmd)).catch_unwind();
            tokio::pin!(execution);
            let finished = match stop {
                Some(stop) => tokio::select! {
                    // Polled first so the executor has registered the command
                    // before a cancel can reach it.
                    biased;
                    outcome = &mut execution => Some(outcome),
                    () = stop.cancelled() => None,
                },
                None => Some(execution.as_mut().await),
            };
            match finished {
                Some(outcome) => outcome,
                None => {
                    info!(task_id = cmd.task_id, "agent stopping, cancelling running command");
                    self.executor.cancel(cmd.task_id, STOP_REASON);
                    execution.await
                }
            }
        };
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(task_id = cmd.task_id, error = %err, "command failed to execute");
                CommandResult::failed(&cmd, err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = cmd.task_id, panic = %message, "executor panicked");
                CommandResult::failed(&cmd, format!("Command execution panicked: {message}"))
            }
        };

        self.finish(cmd, result);
        true
    }

    fn finish(&self, cmd: Arc<Command>, result: CommandResult) {
        debug!(task_id = cmd.task_id, status = ?result.status, "command finished");
        {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.as_ref().is_some_and(|c| c.task_id == cmd.task_id) {
                *in_flight = None;
            }
        }
        lock(&self.results).push(result.clone());
        let _ = self.events.send(ExecutionEvent::Finished {
            command: cmd,
            result,
        });
    }

    /// Take every finished result.
    pub fn drain_results(&self) -> Vec<CommandResult> {
        std::mem::take(&mut *lock(&self.results))
    }

    /// Whether nothing is waiting to run.
    pub fn is_idle(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    /// Whether a command is running right now.
    pub fn has_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Whether anything is queued or running.
    pub fn is_busy(&self) -> bool {
        !self.is_idle() || self.has_in_flight()
    }

    /// IN_PROGRESS report for the running command, if any.
    pub fn in_progress_reports(&self) -> Vec<CommandResult> {
        lock(&self.in_flight)
            .as_deref()
            .map(CommandResult::in_progress)
            .into_iter()
            .collect()
    }

    /// Commands waiting to run.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Queued and finished events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
