//! Process group supervision against real processes.

use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use fleet_agent::infrastructure::process::{ProcessSpec, ProcessWatchdog, WatchdogSettings};
use fleet_agent::services::{CommandQueue, OrchestratorSettings, OutputWindow, ServiceOrchestrator};
use fleet_agent::{Command, CommandStatus};

fn watchdog() -> ProcessWatchdog {
    ProcessWatchdog::new(WatchdogSettings {
        kill_grace: Duration::from_millis(300),
        reap_timeout: Duration::from_secs(3),
    })
}

fn shell(script: &str, timeout: Duration) -> ProcessSpec {
    ProcessSpec::new("/bin/sh", timeout).arg("-c").arg(script)
}

/// Pids in `pgid` that are not zombies, read from /proc.
fn live_members(pgid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
                return false;
            };
            let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
                return false;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            // state, ppid, pgrp
            fields.len() > 2 && fields[0] != "Z" && fields[0] != "X" && fields[2] == pgid.to_string()
        })
        .collect()
}

async fn assert_group_gone(pgid: i32) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !live_members(pgid).is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(live_members(pgid).is_empty(), "survivors in group {pgid}");
}

#[tokio::test]
async fn test_timeout_kills_background_children() {
    let outcome = watchdog()
        .run(
            shell("sleep 30 & sleep 30 & echo started; wait", Duration::from_millis(500)),
            None,
        )
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.exit_code, 124);
    assert!(outcome.stdout.contains("started"));
    assert_group_gone(outcome.pgid.unwrap()).await;
}

#[tokio::test]
async fn test_term_ignoring_group_is_killed() {
    let started = Instant::now();
    let outcome = watchdog()
        .run(
            shell("trap '' TERM; sleep 30 & wait", Duration::from_millis(300)),
            None,
        )
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_group_gone(outcome.pgid.unwrap()).await;
}

#[tokio::test]
async fn test_large_output_is_captured() {
    let outcome = watchdog()
        .run(shell("seq 1 20000", Duration::from_secs(10)), None)
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout.lines().count(), 20000);
    assert_eq!(outcome.stdout.lines().last(), Some("20000"));
}

#[tokio::test]
async fn test_cancel_kills_group() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let run = tokio::spawn(async move {
        watchdog()
            .run(shell("sleep 30 & wait", Duration::from_secs(60)), Some(rx))
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send("shutdown".to_string()).unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.cancelled.as_deref(), Some("shutdown"));
    assert_ne!(outcome.exit_code, 0);
    assert_group_gone(outcome.pgid.unwrap()).await;
}

/// Wait until `path` holds a pid written by a script, and return it.
async fn read_pid(path: &Path) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pid) = fs::read_to_string(path)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
        {
            return pid;
        }
        assert!(Instant::now() < deadline, "script never wrote {}", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_members(pgid: i32, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while live_members(pgid).len() < count && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(live_members(pgid).len() >= count, "group {pgid} never reached {count} members");
}

#[tokio::test]
async fn test_abandoned_run_kills_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let script = format!("echo $$ > '{}'; sleep 30 & sleep 30 & wait", pid_file.display());

    let run = tokio::spawn(async move {
        watchdog().run(shell(&script, Duration::from_secs(60)), None).await
    });
    let pgid = read_pid(&pid_file).await;
    wait_for_members(pgid, 3).await;

    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());
    assert_group_gone(pgid).await;
}

#[tokio::test]
async fn test_stop_interrupts_running_command() {
    let root = tempfile::tempdir().unwrap();
    let packages = root.path().join("packages");
    let tmp = root.path().join("tmp");
    let scripts = packages.join("services/HDFS/package/scripts");
    fs::create_dir_all(&scripts).unwrap();
    // $6 is the agent's tmp directory.
    fs::write(
        scripts.join("hang.sh"),
        "echo $$ > \"$6/pgid\"\nsleep 30 & sleep 30 & wait\n",
    )
    .unwrap();

    let orchestrator = ServiceOrchestrator::new(
        OrchestratorSettings {
            package_dir: packages,
            tmp_dir: tmp.clone(),
            cache_dir: root.path().join("cache"),
            python_interpreter: "python3".to_string(),
            shell: "/bin/sh".to_string(),
            script_log_level: "INFO".to_string(),
            public_hostname: "node1".to_string(),
        },
        watchdog(),
        OutputWindow::default(),
    );
    let queue = Arc::new(CommandQueue::new(
        Arc::new(orchestrator),
        Duration::from_millis(50),
    ));
    let stop = CancellationToken::new();
    let worker = tokio::spawn({
        let queue = Arc::clone(&queue);
        let stop = stop.clone();
        async move { queue.run(stop).await }
    });

    queue.put(
        Command::from_wire(json!({
            "commandId": "1-9",
            "taskId": 9,
            "clusterId": "1",
            "hostname": "node1",
            "role": "DATANODE",
            "roleCommand": "START",
            "serviceName": "HDFS",
            "commandParams": {
                "script": "scripts/hang.sh",
                "script_type": "SHELL",
                "command_timeout": 600
            }
        }))
        .unwrap(),
    );
    let pgid = read_pid(&tmp.join("pgid")).await;
    wait_for_members(pgid, 3).await;

    let stopped_at = Instant::now();
    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop after the stop signal")
        .unwrap();
    assert!(stopped_at.elapsed() < Duration::from_secs(5));
    assert_group_gone(pgid).await;

    let results = queue.drain_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, CommandStatus::Failed);
    assert!(results[0].stderr.contains("Command aborted. Reason: 'agent stopping'"));
}
