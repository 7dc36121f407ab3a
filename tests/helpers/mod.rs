#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use warden::config::WorkerConfig;
use warden::graph::GraphStore;
use warden::layout::LayoutStore;
use warden::ports::PortRegistry;
use warden::supervisor::ManagedProcess;
use warden::tools::ToolContext;

pub const READY_PORT: u16 = 4100;

/// Worker config running `script` under `sh -c`, with short timings for tests.
pub fn sh_worker(script: &str) -> WorkerConfig {
    WorkerConfig {
        command: "sh".into(),
        args: vec!["-c".into(), script.into()],
        startup_timeout_ms: 5_000,
        grace_timeout_ms: 2_000,
        restart_base_delay_ms: 10,
        restart_max_delay_ms: 40,
        max_restarts: 3,
        healthy_after_ms: 60_000,
        ..WorkerConfig::default()
    }
}

/// Script fragment announcing readiness on the default test port.
pub fn announce() -> String {
    format!("echo WARDEN_WORKER_PORT={READY_PORT}")
}

/// Wait (at most 10 s) until the supervisor status satisfies `pred`.
pub async fn wait_for_status(
    rx: &mut watch::Receiver<ManagedProcess>,
    pred: impl FnMut(&ManagedProcess) -> bool,
) -> ManagedProcess {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
        .await
        .expect("timed out waiting for supervisor status")
        .expect("supervisor status channel closed")
        .clone()
}

/// A range of `width + 1` ports starting at one the OS just handed out.
pub fn free_port_range(width: u16) -> std::ops::RangeInclusive<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let start = listener.local_addr().unwrap().port();
    start..=start.saturating_add(width)
}

pub fn temp_registry(dir: &Path) -> PortRegistry {
    PortRegistry::new(dir.join("ports.json"), 3100..=3199).unwrap()
}

/// Tool context over fresh in-memory state, with no supervised worker.
pub fn tool_context(dir: &Path) -> ToolContext {
    ToolContext {
        graph: GraphStore::new(64),
        layout: LayoutStore::shared(),
        registry: Arc::new(temp_registry(dir)),
        worker: None,
        presentation: None,
    }
}
