//! Periodic component status collection.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::AgentResult;
use crate::domain::models::command::Command;
use crate::domain::models::status::{ComponentState, ComponentStatus, StatusKey};
use crate::domain::ports::{StatusObserver, StatusCheck, StatusReporter};
use crate::infrastructure::cache::{CacheDelta, CacheSnapshot};
use crate::services::command_factory::CommandFactory;
use crate::services::orchestrator::ServiceOrchestrator;
use crate::services::registration::RegistrationState;

/// Checks by running the status command: exit 0 means STARTED.
pub struct OrchestratorStatusCheck {
    orchestrator: Arc<ServiceOrchestrator>,
}

impl OrchestratorStatusCheck {
    /// Check through `orchestrator`.
    pub const fn new(orchestrator: Arc<ServiceOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl StatusCheck for OrchestratorStatusCheck {
    async fn check(&self, cmd: &Command) -> AgentResult<ComponentState> {
        let result = self.orchestrator.run(cmd).await;
        Ok(if result.is_success() {
            ComponentState::Started
        } else {
            ComponentState::Installed
        })
    }
}

#[derive(Default)]
struct Reported {
    generation: u64,
    last: HashMap<StatusKey, ComponentState>,
}

/// Runs status commands for every local component and reports changes.
pub struct StatusPoller {
    factory: Arc<CommandFactory>,
    checker: Arc<dyn StatusCheck>,
    reporter: Arc<dyn StatusReporter>,
    observers: Vec<Arc<dyn StatusObserver>>,
    registration: Arc<RegistrationState>,
    interval: Duration,
    reported: Arc<Mutex<Reported>>,
}

fn lock(reported: &Mutex<Reported>) -> MutexGuard<'_, Reported> {
    reported.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StatusPoller {
    /// Poller that reports changed statuses to `reporter` every `interval`.
    pub fn new(
        factory: Arc<CommandFactory>,
        checker: Arc<dyn StatusCheck>,
        reporter: Arc<dyn StatusReporter>,
        registration: Arc<RegistrationState>,
        interval: Duration,
    ) -> Self {
        let reported = Arc::new(Mutex::new(Reported {
            generation: registration.generation(),
            last: HashMap::new(),
        }));

        // Forget what was reported for clusters that left the topology.
        let forget = Arc::clone(&reported);
        factory.caches().topology.on_update(Arc::new(move |delta: &CacheDelta, _: &CacheSnapshot| {
            if delta.removed.is_empty() {
                return;
            }
            lock(&forget)
                .last
                .retain(|(cluster_id, _, _), _| !delta.removed.contains(cluster_id));
        }));

        Self {
            factory,
            checker,
            reporter,
            observers: Vec::new(),
            registration,
            interval,
            reported,
        }
    }

    /// Receive every observation, changed or not.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Poll on every tick until `stop` fires.
    pub async fn run(&self, stop: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "status poller started");
        loop {
            if stop.is_cancelled() {
                break;
            }
            if let Err(panic) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                error!(?panic, "status tick panicked");
            }
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("status poller stopped");
    }

    /// Check every component once. Returns how many statuses were emitted.
    pub async fn tick(&self) -> usize {
        let generation = self.registration.generation();
        {
            let mut reported = lock(&self.reported);
            if reported.generation != generation {
                debug!(generation, "registration changed, resending all statuses");
                reported.last.clear();
                reported.generation = generation;
            }
        }

        let mut batch: Vec<ComponentStatus> = Vec::new();
        for cluster_id in self.factory.cluster_ids() {
            for component in self.factory.host_components(&cluster_id) {
                for status_command in &component.status_commands {
                    if !self.factory.has_cluster(&cluster_id) {
                        debug!(%cluster_id, "cluster vanished during tick");
                        break;
                    }
                    let cmd = self.factory.status_command(&component, status_command);
                    let Some(state) = self.check_once(&cmd).await else {
                        continue;
                    };
                    let status = ComponentStatus {
                        cluster_id: cluster_id.clone(),
                        service_name: component.service_name.clone(),
                        component_name: component.component_name.clone(),
                        command: status_command.clone(),
                        status: state,
                    };

                    for observer in &self.observers {
                        observer.observe(&status);
                    }

                    let changed = lock(&self.reported).last.get(&status.key()) != Some(&state);
                    if changed && !batch.iter().any(|s| s.key() == status.key()) {
                        batch.push(status);
                    }
                }
            }
        }

        if batch.is_empty() {
            return 0;
        }
        if !self.registration.is_registered() {
            debug!(pending = batch.len(), "not registered, holding status changes");
            return 0;
        }

        {
            let mut reported = lock(&self.reported);
            if reported.generation == generation {
                for status in &batch {
                    reported.last.insert(status.key(), status.status);
                }
            }
        }

        let emitted = batch.len();
        debug!(emitted, "reporting changed statuses");
        self.reporter.report(batch);
        emitted
    }

    async fn check_once(&self, cmd: &Command) -> Option<ComponentState> {
        match AssertUnwindSafe(self.checker.check(cmd)).catch_unwind().await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(err)) => {
                warn!(component = %cmd.component(), error = %err, "status check failed");
                None
            }
            Err(_) => {
                error!(component = %cmd.component(), "status checker panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::AgentError;
    use crate::infrastructure::cache::CacheFamily;
    use crate::services::status_outbox::StatusOutbox;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedCheck {
        states: Mutex<HashMap<String, ComponentState>>,
    }

    impl ScriptedCheck {
        fn set(&self, component: &str, state: ComponentState) {
            self.states.lock().unwrap().insert(component.to_string(), state);
        }
    }

    #[async_trait]
    impl StatusCheck for ScriptedCheck {
        async fn check(&self, cmd: &Command) -> AgentResult<ComponentState> {
            match cmd.component() {
                "BROKEN" => panic!("check exploded"),
                "FAILING" => Err(AgentError::ExecutionFailed("no script".into())),
                name => Ok(self
                    .states
                    .lock()
                    .unwrap()
                    .get(name)
                    .copied()
                    .unwrap_or(ComponentState::Started)),
            }
        }
    }

    #[derive(Default)]
    struct CountingObserver(AtomicUsize);

    impl StatusObserver for CountingObserver {
        fn observe(&self, _status: &ComponentStatus) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn topology(components: &[&str]) -> Value {
        let components: Vec<Value> = components
            .iter()
            .map(|name| {
                json!({
                    "serviceName": "HDFS",
                    "componentName": name,
                    "hostIds": [0],
                    "statusCommandsToRun": ["STATUS"]
                })
            })
            .collect();
        json!({"hosts": [{"hostId": 0, "hostName": "node1"}], "components": components})
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        caches: CacheFamily,
        checker: Arc<ScriptedCheck>,
        outbox: Arc<StatusOutbox>,
        observer: Arc<CountingObserver>,
        registration: Arc<RegistrationState>,
        poller: StatusPoller,
    }

    fn fixture(components: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let caches = CacheFamily::open(dir.path());
        caches
            .topology
            .rewrite([("1".to_string(), topology(components))].into(), None)
            .unwrap();
        let factory = Arc::new(CommandFactory::new(caches.clone(), "node1".into()));
        let checker = Arc::new(ScriptedCheck::default());
        let outbox = Arc::new(StatusOutbox::new());
        let observer = Arc::new(CountingObserver::default());
        let registration = Arc::new(RegistrationState::new());
        registration.mark_registered();
        let poller = StatusPoller::new(
            factory,
            checker.clone(),
            outbox.clone(),
            registration.clone(),
            Duration::from_millis(20),
        )
        .with_observer(observer.clone());
        Fixture {
            _dir: dir,
            caches,
            checker,
            outbox,
            observer,
            registration,
            poller,
        }
    }

    #[tokio::test]
    async fn test_only_changes_are_emitted() {
        let f = fixture(&["DATANODE", "NAMENODE"]);
        assert_eq!(f.poller.tick().await, 2);
        assert_eq!(f.poller.tick().await, 0);

        f.checker.set("DATANODE", ComponentState::Installed);
        assert_eq!(f.poller.tick().await, 1);

        let drained = f.outbox.drain();
        assert_eq!(drained.len(), 2);
        let datanode = drained.iter().find(|s| s.component_name == "DATANODE").unwrap();
        assert_eq!(datanode.status, ComponentState::Installed);
        assert_eq!(f.observer.0.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_nothing_committed_while_unregistered() {
        let f = fixture(&["DATANODE"]);
        f.registration.mark_unregistered();
        assert_eq!(f.poller.tick().await, 0);
        assert!(f.outbox.is_empty());

        f.registration.mark_registered();
        assert_eq!(f.poller.tick().await, 1);
    }

    #[tokio::test]
    async fn test_reregistration_resends_everything() {
        let f = fixture(&["DATANODE"]);
        assert_eq!(f.poller.tick().await, 1);
        assert_eq!(f.poller.tick().await, 0);

        f.registration.mark_registered();
        assert_eq!(f.poller.tick().await, 1);
    }

    #[tokio::test]
    async fn test_removed_cluster_is_forgotten() {
        let f = fixture(&["DATANODE"]);
        assert_eq!(f.poller.tick().await, 1);

        f.caches.topology.rewrite(BTreeMap::new(), None).unwrap();
        assert_eq!(f.poller.tick().await, 0);

        f.caches
            .topology
            .rewrite([("1".to_string(), topology(&["DATANODE"]))].into(), None)
            .unwrap();
        assert_eq!(f.poller.tick().await, 1);
    }

    #[tokio::test]
    async fn test_check_failures_do_not_stop_tick() {
        let f = fixture(&["BROKEN", "FAILING", "DATANODE"]);
        assert_eq!(f.poller.tick().await, 1);
        assert_eq!(f.outbox.drain()[0].component_name, "DATANODE");
    }

    #[tokio::test]
    async fn test_run_stops_promptly() {
        let f = Arc::new(fixture(&["DATANODE"]));
        let stop = CancellationToken::new();
        let handle = tokio::spawn({
            let f = Arc::clone(&f);
            let stop = stop.clone();
            async move { f.poller.run(stop).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!f.outbox.is_empty());
    }
}
