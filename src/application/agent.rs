//! Agent wiring: builds every component from the configuration and runs
//! each loop on its own task until the stop signal fires.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::shutdown::StopSignal;
use crate::domain::models::config::Config;
use crate::domain::ports::{CommandExecutor, CoordinatorClient, StatusCheck};
use crate::infrastructure::cache::CacheFamily;
use crate::infrastructure::coordinator::HttpCoordinatorClient;
use crate::services::{
    CommandFactory, CommandQueue, HeartbeatLoop, HeartbeatSettings, OrchestratorStatusCheck,
    RecoveryPolicyEngine, RegistrationState, ServiceOrchestrator, StatusOutbox, StatusPoller,
};

/// How long the agent waits for its loops to wind down.
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Host name reported to the coordinator.
pub fn resolve_hostname(config: &Config) -> Result<String> {
    if let Some(name) = config.hostname.as_deref().filter(|n| !n.trim().is_empty()) {
        return Ok(name.trim().to_string());
    }
    nix::unistd::gethostname()
        .context("failed to read the system host name")?
        .into_string()
        .map_err(|raw| anyhow::anyhow!("system host name is not valid UTF-8: {raw:?}"))
}

/// All long-lived components of a running agent.
pub struct Agent {
    /// Name reported to the coordinator.
    pub hostname: String,
    /// Local mirror of coordinator state.
    pub caches: CacheFamily,
    /// Serial command execution.
    pub queue: Arc<CommandQueue>,
    /// Statuses waiting for the next heartbeat.
    pub outbox: Arc<StatusOutbox>,
    /// Whether the coordinator knows this agent.
    pub registration: Arc<RegistrationState>,
    /// Automatic recovery.
    pub recovery: Arc<RecoveryPolicyEngine>,
    /// Periodic status checks.
    pub poller: Arc<StatusPoller>,
    /// Coordinator exchange.
    pub heartbeat: Arc<HeartbeatLoop>,
    stop: StopSignal,
}

impl Agent {
    /// Build an agent talking to the configured coordinator over HTTP.
    pub fn from_config(config: &Config, stop: StopSignal) -> Result<Self> {
        let hostname = resolve_hostname(config)?;
        let client = HttpCoordinatorClient::new(
            &config.coordinator.url,
            &hostname,
            Duration::from_secs(config.coordinator.request_timeout_secs),
        )
        .context("failed to build the coordinator client")?;
        let orchestrator = Arc::new(ServiceOrchestrator::from_config(config, &hostname));
        let checker = Arc::new(OrchestratorStatusCheck::new(Arc::clone(&orchestrator)));
        Ok(Self::assemble(config, hostname, Arc::new(client), orchestrator, checker, stop))
    }

    /// Wire the components around the given edges.
    pub fn assemble(
        config: &Config,
        hostname: String,
        client: Arc<dyn CoordinatorClient>,
        executor: Arc<dyn CommandExecutor>,
        checker: Arc<dyn StatusCheck>,
        stop: StopSignal,
    ) -> Self {
        let caches = CacheFamily::open(&config.paths.cache_dir);
        let queue = Arc::new(CommandQueue::new(
            executor,
            Duration::from_millis(config.execution.queue_idle_wait_ms),
        ));
        let factory = Arc::new(CommandFactory::new(caches.clone(), hostname.clone()));
        let outbox = Arc::new(StatusOutbox::new());
        let registration = Arc::new(RegistrationState::new());

        let recovery = Arc::new(RecoveryPolicyEngine::new(
            config.recovery.policy.clone(),
            Arc::clone(&queue),
            Arc::clone(&factory),
            &config.paths.cache_dir,
            Duration::from_secs(config.recovery.evaluation_interval_secs),
        ));
        recovery.track_configuration_changes();

        let poller = Arc::new(
            StatusPoller::new(
                Arc::clone(&factory),
                checker,
                outbox.clone(),
                Arc::clone(&registration),
                Duration::from_secs(config.status.poll_interval_secs),
            )
            .with_observer(recovery.clone()),
        );

        let heartbeat = Arc::new(HeartbeatLoop::new(
            client,
            Arc::clone(&queue),
            caches.clone(),
            Arc::clone(&outbox),
            Arc::clone(&recovery),
            Arc::clone(&registration),
            hostname.clone(),
            HeartbeatSettings::from(&config.heartbeat),
        ));

        Self {
            hostname,
            caches,
            queue,
            outbox,
            registration,
            recovery,
            poller,
            heartbeat,
            stop,
        }
    }

    /// Signal that stops every loop.
    pub const fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Start every loop and wait until all of them have stopped.
    pub async fn run(&self) -> Result<()> {
        info!(hostname = %self.hostname, "agent starting");

        let handles: Vec<(&'static str, JoinHandle<()>)> = vec![
            ("command-queue", {
                let queue = Arc::clone(&self.queue);
                let token = self.stop.token();
                tokio::spawn(async move { queue.run(token).await })
            }),
            ("status-poller", {
                let poller = Arc::clone(&self.poller);
                let token = self.stop.token();
                tokio::spawn(async move { poller.run(token).await })
            }),
            ("recovery-engine", {
                let recovery = Arc::clone(&self.recovery);
                let token = self.stop.token();
                tokio::spawn(async move { recovery.run(token).await })
            }),
            ("heartbeat", {
                let heartbeat = Arc::clone(&self.heartbeat);
                let token = self.stop.token();
                tokio::spawn(async move { heartbeat.run(token).await })
            }),
        ];

        self.stop.stopped().await;
        info!("waiting for agent loops to finish");

        let mut failed = Vec::new();
        for (name, handle) in handles {
            match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(task = name, error = %err, "agent loop panicked");
                    failed.push(name);
                }
                Err(_) => {
                    warn!(task = name, "agent loop did not stop in time");
                    failed.push(name);
                }
            }
        }

        if failed.is_empty() {
            info!("agent stopped");
            Ok(())
        } else {
            anyhow::bail!("agent loops failed to stop cleanly: {}", failed.join(", "))
        }
    }
}
