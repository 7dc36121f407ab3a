//! Worker process supervision.
//!
//! [`Supervisor::start`] spawns the worker and waits for it to announce its
//! port. A monitor task then owns the child: it restarts crashed workers with
//! capped exponential backoff, gives up after `max_restarts` consecutive
//! crashes, and performs the staged SIGTERM → grace → SIGKILL shutdown when
//! asked to stop.

mod process;

pub use process::StopOutcome;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::WorkerConfig;
use process::{spawn_worker, terminate, Worker};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker did not announce its port within {timeout_ms} ms")]
    StartupTimeout { timeout_ms: u64 },

    #[error("worker exited before it was ready (exit code {code:?})")]
    ExitedBeforeReady { code: Option<i32> },

    #[error("supervision given up after {crashes} consecutive crashes")]
    GivenUp { crashes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

/// Snapshot of the supervised worker.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedProcess {
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub port: Option<u16>,
    pub crash_count: u32,
    pub restarts: u32,
    pub next_restart_delay_ms: Option<u64>,
    /// Terminal: the crash cap was hit and no further restart will happen.
    pub given_up: bool,
}

impl ManagedProcess {
    /// The worker's port, only while it is running.
    pub fn live_port(&self) -> Option<u16> {
        match self.state {
            ProcessState::Running => self.port,
            _ => None,
        }
    }
}

/// Passed to every `on_exit` callback.
#[derive(Debug, Clone, Serialize)]
pub struct ExitReport {
    pub pid: u32,
    pub code: Option<i32>,
    /// `true` when the exit was requested through [`Supervisor::stop`].
    pub requested: bool,
    pub crash_count: u32,
    pub given_up: bool,
}

type ExitCallback = Box<dyn Fn(&ExitReport) + Send + Sync>;

enum Control {
    Stop {
        grace: Duration,
        reply: oneshot::Sender<StopOutcome>,
    },
}

pub struct Supervisor {
    status: watch::Receiver<ManagedProcess>,
    control: mpsc::Sender<Control>,
    callbacks: Arc<Mutex<Vec<ExitCallback>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    default_grace: Duration,
}

impl Supervisor {
    /// Spawn the worker and wait until it is ready. Startup failures are returned,
    /// never left to fail in the background.
    pub async fn start(config: WorkerConfig) -> Result<Self, SupervisorError> {
        let worker = spawn_worker(&config).await?;

        let (status_tx, status_rx) = watch::channel(ManagedProcess {
            pid: Some(worker.pid),
            state: ProcessState::Running,
            port: Some(worker.port),
            crash_count: 0,
            restarts: 0,
            next_restart_delay_ms: None,
            given_up: false,
        });
        let (control_tx, control_rx) = mpsc::channel(8);
        let callbacks: Arc<Mutex<Vec<ExitCallback>>> = Arc::default();
        let default_grace = config.grace_timeout();

        let monitor = Monitor {
            backoff: Backoff::from_millis(config.restart_base_delay_ms, config.restart_max_delay_ms),
            config,
            status: status_tx,
            control: control_rx,
            callbacks: Arc::clone(&callbacks),
            crash_count: 0,
            restarts: 0,
        };
        let task = tokio::spawn(monitor.run(worker));

        Ok(Self {
            status: status_rx,
            control: control_tx,
            callbacks,
            task: Mutex::new(Some(task)),
            default_grace,
        })
    }

    pub fn status(&self) -> ManagedProcess {
        self.status.borrow().clone()
    }

    /// The worker's current port, `None` while it is not running.
    pub fn port(&self) -> Option<u16> {
        self.status.borrow().live_port()
    }

    /// Watch every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ManagedProcess> {
        self.status.clone()
    }

    /// Register a callback run on every worker exit, requested or not.
    ///
    /// Callbacks run on the monitor task and must not call `on_exit` themselves.
    pub fn on_exit(&self, callback: impl Fn(&ExitReport) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Stop with the configured grace period.
    pub async fn shutdown(&self) -> StopOutcome {
        self.stop(self.default_grace).await
    }

    /// SIGTERM, wait up to `grace` for the exit, SIGKILL only after that.
    /// Cancels any pending restart. Safe to call more than once.
    pub async fn stop(&self, grace: Duration) -> StopOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let outcome = match self
            .control
            .send(Control::Stop {
                grace,
                reply: reply_tx,
            })
            .await
        {
            Ok(()) => reply_rx.await.unwrap_or(StopOutcome::NotRunning),
            Err(_) => StopOutcome::NotRunning,
        };

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "supervisor monitor task failed");
            }
        }
        outcome
    }
}

struct Monitor {
    config: WorkerConfig,
    status: watch::Sender<ManagedProcess>,
    control: mpsc::Receiver<Control>,
    callbacks: Arc<Mutex<Vec<ExitCallback>>>,
    backoff: Backoff,
    crash_count: u32,
    restarts: u32,
}

impl Monitor {
    async fn run(mut self, initial: Worker) {
        let mut worker = Some(initial);

        loop {
            match worker.take() {
                Some(mut w) => {
                    self.set(ProcessState::Running, Some(w.pid), Some(w.port), None);
                    let healthy = tokio::time::sleep(self.config.healthy_after());
                    tokio::pin!(healthy);
                    let mut streak_open = self.crash_count > 0;
                    loop {
                        tokio::select! {
                            status = w.child.wait() => {
                                let code = status.ok().and_then(|s| s.code());
                                let ran_for = w.started_at.elapsed();
                                tracing::warn!(
                                    pid = w.pid,
                                    ?code,
                                    ran_for_ms = ran_for.as_millis() as u64,
                                    "worker exited unexpectedly"
                                );
                                self.record_crash(ran_for);
                                self.notify(w.pid, code, false);
                                break;
                            }
                            _ = &mut healthy, if streak_open => {
                                streak_open = false;
                                tracing::info!(pid = w.pid, crashes = self.crash_count, "worker running healthy, crash count reset");
                                self.crash_count = 0;
                                self.set(ProcessState::Running, Some(w.pid), Some(w.port), None);
                            }
                            cmd = self.control.recv() => {
                                let (grace, reply) = match cmd {
                                    Some(Control::Stop { grace, reply }) => (grace, Some(reply)),
                                    None => (self.config.grace_timeout(), None),
                                };
                                self.set(ProcessState::Stopping, Some(w.pid), Some(w.port), None);
                                let outcome = terminate(&mut w.child, w.pid, grace).await;
                                let code = match outcome {
                                    StopOutcome::Graceful { code } | StopOutcome::AlreadyExited { code } => code,
                                    _ => None,
                                };
                                self.set(ProcessState::Exited, None, None, None);
                                self.notify(w.pid, code, true);
                                if let Some(reply) = reply {
                                    let _ = reply.send(outcome);
                                }
                                return;
                            }
                        }
                    }
                }
                // the previous restart attempt never produced a ready worker
                None => self.record_crash(Duration::ZERO),
            }

            if self.crash_count > self.config.max_restarts {
                tracing::error!(
                    crashes = self.crash_count,
                    max_restarts = self.config.max_restarts,
                    "worker keeps crashing, supervision given up"
                );
                let crashes = self.crash_count;
                self.status.send_modify(|s| {
                    s.state = ProcessState::Failed;
                    s.crash_count = crashes;
                    s.pid = None;
                    s.port = None;
                    s.next_restart_delay_ms = None;
                    s.given_up = true;
                });
                return;
            }

            let delay = self
                .backoff
                .escalated(self.crash_count, self.config.restart_exponent_cap);
            tracing::info!(
                crash_count = self.crash_count,
                delay_ms = delay.as_millis() as u64,
                "scheduling worker restart"
            );
            self.set(ProcessState::Failed, None, None, Some(delay));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = self.control.recv() => {
                    tracing::info!("stop requested, pending restart cancelled");
                    self.set(ProcessState::Exited, None, None, None);
                    if let Some(Control::Stop { reply, .. }) = cmd {
                        let _ = reply.send(StopOutcome::NotRunning);
                    }
                    return;
                }
            }

            self.set(ProcessState::Starting, None, None, None);
            match spawn_worker(&self.config).await {
                Ok(w) => {
                    self.restarts += 1;
                    tracing::info!(pid = w.pid, port = w.port, restarts = self.restarts, "worker restarted");
                    worker = Some(w);
                }
                Err(e) => {
                    tracing::error!(error = %e, "worker restart failed");
                }
            }
        }
    }

    /// A run that lasted long enough counts as healthy and clears the streak first.
    fn record_crash(&mut self, ran_for: Duration) {
        if ran_for >= self.config.healthy_after() && self.crash_count > 0 {
            tracing::info!(
                ran_for_ms = ran_for.as_millis() as u64,
                "worker ran healthy before crashing, resetting crash count"
            );
            self.crash_count = 0;
        }
        self.crash_count += 1;
    }

    fn set(&self, state: ProcessState, pid: Option<u32>, port: Option<u16>, delay: Option<Duration>) {
        let crash_count = self.crash_count;
        let restarts = self.restarts;
        self.status.send_modify(|s| {
            s.state = state;
            s.pid = pid;
            s.port = port;
            s.crash_count = crash_count;
            s.restarts = restarts;
            s.next_restart_delay_ms = delay.map(|d| d.as_millis() as u64);
        });
    }

    fn notify(&self, pid: u32, code: Option<i32>, requested: bool) {
        let report = ExitReport {
            pid,
            code,
            requested,
            crash_count: self.crash_count,
            given_up: !requested && self.crash_count > self.config.max_restarts,
        };
        if let Ok(callbacks) = self.callbacks.lock() {
            for callback in callbacks.iter() {
                callback(&report);
            }
        }
    }
}
