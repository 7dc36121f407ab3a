#![cfg(unix)]

mod helpers;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use helpers::{announce, sh_worker, wait_for_status, READY_PORT};
use warden::supervisor::{ExitReport, ProcessState, StopOutcome, Supervisor, SupervisorError};

#[tokio::test]
async fn start_waits_for_the_announced_port() {
    let config = sh_worker(
        "echo booting; echo WARDEN_WORKER_PORT=oops; echo WARDEN_WORKER_PORT=4123; exec sleep 30",
    );
    let supervisor = Supervisor::start(config).await.unwrap();

    let status = supervisor.status();
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.port, Some(4123));
    assert_eq!(supervisor.port(), Some(4123));
    assert!(status.pid.is_some());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn cooperative_worker_exits_within_grace_and_is_not_killed() {
    let script = format!("trap 'exit 0' TERM; {}; while true; do sleep 0.1; done", announce());
    let mut config = sh_worker(&script);
    config.grace_timeout_ms = 5_000;
    let supervisor = Supervisor::start(config).await.unwrap();

    let started = Instant::now();
    let outcome = supervisor.stop(Duration::from_secs(5)).await;

    assert_eq!(outcome, StopOutcome::Graceful { code: Some(0) });
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(supervisor.status().state, ProcessState::Exited);
}

#[tokio::test]
async fn stubborn_worker_is_killed_only_after_grace() {
    let script = format!("trap '' TERM; {}; while true; do sleep 0.1; done", announce());
    let supervisor = Supervisor::start(sh_worker(&script)).await.unwrap();

    let grace = Duration::from_millis(400);
    let started = Instant::now();
    let outcome = supervisor.stop(grace).await;

    assert_eq!(outcome, StopOutcome::Forced);
    assert!(started.elapsed() >= grace);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let script = format!("{}; exec sleep 30", announce());
    let supervisor = Supervisor::start(sh_worker(&script)).await.unwrap();

    assert!(matches!(
        supervisor.stop(Duration::from_secs(2)).await,
        StopOutcome::Graceful { .. }
    ));
    assert_eq!(supervisor.stop(Duration::from_secs(2)).await, StopOutcome::NotRunning);
}

#[tokio::test]
async fn crash_loop_gives_up_after_max_restarts() {
    // stay up briefly so the exit callback is registered before the first crash
    let script = format!("{}; sleep 0.3; exit 3", announce());
    let supervisor = Supervisor::start(sh_worker(&script)).await.unwrap();

    let reports: Arc<Mutex<Vec<ExitReport>>> = Arc::default();
    let sink = Arc::clone(&reports);
    supervisor.on_exit(move |report| sink.lock().unwrap().push(report.clone()));

    let mut rx = supervisor.subscribe();
    let status = wait_for_status(&mut rx, |s| s.given_up).await;

    assert_eq!(status.state, ProcessState::Failed);
    assert_eq!(status.restarts, 3);
    assert_eq!(status.crash_count, 4);
    assert_eq!(status.port, None);

    let reports = reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|r| !r.requested && r.code == Some(3)));
    assert!(reports.last().unwrap().given_up);
    assert!(!reports[0].given_up);

    assert_eq!(supervisor.stop(Duration::from_secs(1)).await, StopOutcome::NotRunning);
}

#[tokio::test]
async fn healthy_runs_reset_the_crash_count() {
    let script = format!("{}; sleep 0.05; exit 1", announce());
    let mut config = sh_worker(&script);
    config.healthy_after_ms = 0;
    let supervisor = Supervisor::start(config).await.unwrap();

    let mut rx = supervisor.subscribe();
    let status = wait_for_status(&mut rx, |s| s.restarts >= 5).await;
    assert!(!status.given_up);
    assert!(status.crash_count <= 1);

    supervisor.stop(Duration::from_secs(1)).await;
    assert!(!supervisor.status().given_up);
}

#[tokio::test]
async fn restart_brings_back_a_port() {
    let counter = Arc::new(AtomicU32::new(0));
    // first run crashes, later runs stay up
    let marker = tempfile::NamedTempFile::new().unwrap();
    let path = marker.path().display().to_string();
    let script = format!(
        "if [ -s {path} ]; then {announce}; exec sleep 30; else echo x > {path}; {announce}; sleep 0.1; exit 9; fi",
        announce = announce()
    );
    let supervisor = Supervisor::start(sh_worker(&script)).await.unwrap();
    let seen = Arc::clone(&counter);
    supervisor.on_exit(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let mut rx = supervisor.subscribe();
    let status = wait_for_status(&mut rx, |s| s.restarts == 1 && s.state == ProcessState::Running).await;
    assert_eq!(status.live_port(), Some(READY_PORT));
    assert_eq!(status.crash_count, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn stop_during_backoff_cancels_the_restart() {
    let script = format!("{}; sleep 0.1; exit 2", announce());
    let mut config = sh_worker(&script);
    config.restart_base_delay_ms = 30_000;
    config.restart_max_delay_ms = 30_000;
    let supervisor = Supervisor::start(config).await.unwrap();

    let mut rx = supervisor.subscribe();
    let status = wait_for_status(&mut rx, |s| s.next_restart_delay_ms.is_some()).await;
    assert_eq!(status.next_restart_delay_ms, Some(30_000));

    let started = Instant::now();
    assert_eq!(supervisor.stop(Duration::from_secs(1)).await, StopOutcome::NotRunning);
    assert!(started.elapsed() < Duration::from_secs(5));

    let status = supervisor.status();
    assert_eq!(status.state, ProcessState::Exited);
    assert_eq!(status.restarts, 0);
}

#[tokio::test]
async fn restart_delay_doubles_from_the_first_crash() {
    let script = format!("{}; sleep 0.05; exit 5", announce());
    let mut config = sh_worker(&script);
    config.restart_base_delay_ms = 100;
    config.restart_max_delay_ms = 10_000;
    let supervisor = Supervisor::start(config).await.unwrap();

    let mut rx = supervisor.subscribe();
    for (crashes, expected) in [(1, 200), (2, 400), (3, 800)] {
        let status = wait_for_status(&mut rx, |s| {
            s.crash_count == crashes && s.next_restart_delay_ms.is_some()
        })
        .await;
        assert_eq!(status.next_restart_delay_ms, Some(expected), "after crash {crashes}");
    }

    let status = wait_for_status(&mut rx, |s| s.given_up).await;
    assert_eq!(status.restarts, 3);
}

#[tokio::test]
async fn crash_count_clears_while_the_worker_stays_up() {
    let marker = tempfile::NamedTempFile::new().unwrap();
    let path = marker.path().display().to_string();
    let script = format!(
        "if [ -s {path} ]; then {announce}; exec sleep 30; else echo x > {path}; {announce}; sleep 0.1; exit 9; fi",
        announce = announce()
    );
    let mut config = sh_worker(&script);
    config.healthy_after_ms = 500;
    let supervisor = Supervisor::start(config).await.unwrap();

    let mut rx = supervisor.subscribe();
    let status = wait_for_status(&mut rx, |s| s.restarts == 1 && s.state == ProcessState::Running).await;
    assert_eq!(status.crash_count, 1);

    // no further crash is needed for the count to drop
    let status = wait_for_status(&mut rx, |s| s.crash_count == 0).await;
    assert_eq!(status.state, ProcessState::Running);
    assert_eq!(status.restarts, 1);
    assert_eq!(supervisor.status().live_port(), Some(READY_PORT));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn missing_binary_is_a_start_error() {
    let mut config = sh_worker("");
    config.command = "/nonexistent/warden-worker".into();
    config.args.clear();

    match Supervisor::start(config).await {
        Err(SupervisorError::Spawn { command, .. }) => {
            assert_eq!(command, "/nonexistent/warden-worker");
        }
        Err(other) => panic!("expected spawn error, got {other}"),
        Ok(_) => panic!("expected spawn error"),
    }
}

#[tokio::test]
async fn silent_worker_times_out() {
    let mut config = sh_worker("exec sleep 30");
    config.startup_timeout_ms = 200;
    config.grace_timeout_ms = 500;

    let started = Instant::now();
    let result = Supervisor::start(config).await;
    assert!(matches!(result, Err(SupervisorError::StartupTimeout { timeout_ms: 200 })));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn early_exit_reports_the_code() {
    let result = Supervisor::start(sh_worker("echo starting; exit 7")).await;
    assert!(matches!(
        result,
        Err(SupervisorError::ExitedBeforeReady { code: Some(7) })
    ));
}
