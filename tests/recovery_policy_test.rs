//! Recovery engine driving real queue traffic.

mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{topology, RecordingExecutor};
use fleet_agent::domain::models::recovery::RecoverySummary;
use fleet_agent::domain::ports::StatusObserver;
use fleet_agent::{
    CacheFamily, CommandFactory, CommandQueue, ComponentState, ComponentStatus, RecoveryConfig,
    RecoveryMode, RecoveryPolicyEngine, RoleCommand,
};

struct Fixture {
    dir: tempfile::TempDir,
    queue: Arc<CommandQueue>,
    factory: Arc<CommandFactory>,
    executor: Arc<RecordingExecutor>,
    engine: RecoveryPolicyEngine,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let caches = CacheFamily::open(dir.path());
    caches
        .topology
        .rewrite([("1".to_string(), topology(&["DATANODE", "NAMENODE"]))].into(), None)
        .unwrap();
    let executor = Arc::new(RecordingExecutor::default());
    let queue = Arc::new(CommandQueue::new(executor.clone(), Duration::from_millis(10)));
    let factory = Arc::new(CommandFactory::new(caches, "node1".into()));
    let engine = RecoveryPolicyEngine::new(
        RecoveryConfig::default(),
        Arc::clone(&queue),
        Arc::clone(&factory),
        dir.path(),
        Duration::from_secs(60),
    );
    engine.apply_coordinator_config(&json!({
        "type": "AUTO_START",
        "maxCount": 2,
        "windowInMinutes": 60,
        "retryGap": 5,
        "maxLifetimeCount": 3,
        "components": [
            {"component_name": "DATANODE", "desired_state": "STARTED"}
        ]
    }));
    Fixture {
        dir,
        queue,
        factory,
        executor,
        engine,
    }
}

fn observed(component: &str, state: ComponentState) -> ComponentStatus {
    ComponentStatus {
        cluster_id: "1".into(),
        service_name: "HDFS".into(),
        component_name: component.into(),
        command: "STATUS".into(),
        status: state,
    }
}

#[tokio::test]
async fn test_stopped_component_is_restarted_within_limits() {
    let f = fixture();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

    f.engine.observe(&observed("DATANODE", ComponentState::Installed));
    f.engine.observe(&observed("NAMENODE", ComponentState::Installed));
    assert_eq!(f.engine.evaluate_at(t0), 1);

    // Queue busy: no more recovery until it drains.
    assert_eq!(f.engine.evaluate_at(t0 + ChronoDuration::minutes(10)), 0);
    assert_eq!(f.queue.process_pending().await, 1);

    let first = &f.executor.executed()[0];
    assert_eq!(first.role, "DATANODE");
    assert_eq!(first.role_command, RoleCommand::Start);

    // Still down, but inside the retry gap.
    assert_eq!(f.engine.evaluate_at(t0 + ChronoDuration::minutes(2)), 0);
    // Second attempt allowed once the gap passed.
    assert_eq!(f.engine.evaluate_at(t0 + ChronoDuration::minutes(6)), 1);
    f.queue.process_pending().await;
    // Window now holds max_count attempts.
    assert_eq!(f.engine.evaluate_at(t0 + ChronoDuration::minutes(12)), 0);

    let report = f.engine.report();
    assert_eq!(report.component_reports.len(), 1);
    assert_eq!(report.component_reports[0].name, "DATANODE");
    assert_eq!(report.component_reports[0].num_attempts, 2);
    assert!(!report.component_reports[0].limit_reached);
    assert_ne!(report.summary, RecoverySummary::Disabled);
}

#[tokio::test]
async fn test_started_component_needs_nothing() {
    let f = fixture();
    f.engine.observe(&observed("DATANODE", ComponentState::Started));
    assert_eq!(f.engine.evaluate_at(Utc::now()), 0);
    assert!(f.queue.is_idle());
}

#[tokio::test]
async fn test_counters_survive_restart() {
    let f = fixture();
    let t0 = Utc::now();
    f.engine.observe(&observed("DATANODE", ComponentState::Installed));
    assert_eq!(f.engine.evaluate_at(t0), 1);
    f.queue.process_pending().await;

    let restarted = RecoveryPolicyEngine::new(
        RecoveryConfig {
            mode: RecoveryMode::AutoStart,
            max_count: 2,
            window_in_minutes: 60,
            retry_gap: 5,
            max_lifetime_count: 3,
            enabled_components: ["DATANODE".to_string()].into(),
        },
        Arc::clone(&f.queue),
        Arc::clone(&f.factory),
        f.dir.path(),
        Duration::from_secs(60),
    );
    let state = restarted.state("datanode").unwrap();
    assert_eq!(state.lifetime_count, 1);
    assert_eq!(state.failure_timestamps.len(), 1);
    // The retry gap still applies after the restart.
    assert_eq!(restarted.evaluate_at(t0 + ChronoDuration::minutes(1)), 0);
}

#[tokio::test]
async fn test_disabling_from_coordinator_stops_recovery() {
    let f = fixture();
    f.engine.observe(&observed("DATANODE", ComponentState::Installed));
    f.engine.apply_coordinator_config(&json!({"type": "DEFAULT"}));

    assert_eq!(f.engine.evaluate_at(Utc::now()), 0);
    assert_eq!(f.engine.report().summary, RecoverySummary::Disabled);
}

#[tokio::test]
async fn test_full_mode_restarts_component_after_configuration_change() {
    let f = fixture();
    f.engine.apply_coordinator_config(&json!({
        "type": "FULL",
        "maxCount": 2,
        "windowInMinutes": 60,
        "retryGap": 5,
        "maxLifetimeCount": 3,
        "components": [
            {"component_name": "DATANODE", "desired_state": "STARTED"}
        ]
    }));
    let engine = Arc::new(f.engine);
    engine.track_configuration_changes();
    engine.observe(&observed("DATANODE", ComponentState::Started));

    let configurations = &f.factory.caches().configurations;
    for version in ["1", "2"] {
        configurations
            .rewrite(
                [("1".to_string(), json!({"configurations": {"hdfs-site": {"dfs.replication": version}}}))]
                    .into(),
                None,
            )
            .unwrap();
    }
    assert!(engine.state("DATANODE").unwrap().stale_config);

    assert_eq!(engine.evaluate_at(Utc::now()), 1);
    assert_eq!(f.queue.process_pending().await, 1);

    let restart = &f.executor.executed()[0];
    assert_eq!(restart.role, "DATANODE");
    assert_eq!(restart.role_command, RoleCommand::CustomCommand);
    assert_eq!(restart.custom_command().as_deref(), Some("RESTART"));
    assert_eq!(restart.configurations["hdfs-site"]["dfs.replication"], "2");
}
