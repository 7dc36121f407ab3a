//! Worker spawning, readiness, and staged termination.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use super::SupervisorError;
use crate::config::{expand_tilde, WorkerConfig};

/// A spawned worker that has announced its port.
pub(crate) struct Worker {
    pub child: Child,
    pub pid: u32,
    pub port: u16,
    pub started_at: Instant,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StopOutcome {
    /// The worker exited on its own within the grace period.
    Graceful { code: Option<i32> },
    /// The grace period elapsed and the worker was killed.
    Forced,
    /// The worker had already exited before anything was sent.
    AlreadyExited { code: Option<i32> },
    /// No worker was running (e.g. a restart was pending and got cancelled).
    NotRunning,
}

pub(crate) async fn spawn_worker(config: &WorkerConfig) -> Result<Worker, SupervisorError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(expand_tilde(dir));
    }

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        command: config.command.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();
    tracing::info!(pid, command = %config.command, "worker spawned, waiting for ready line");

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(BufReader::new(stderr).lines(), pid, "stderr"));
    }
    let Some(stdout) = child.stdout.take() else {
        terminate(&mut child, pid, config.grace_timeout()).await;
        return Err(SupervisorError::ExitedBeforeReady { code: None });
    };
    let mut lines = BufReader::new(stdout).lines();

    let announced = tokio::time::timeout(
        config.startup_timeout(),
        read_ready_port(&mut lines, &config.ready_prefix),
    )
    .await;

    match announced {
        Ok(Some(port)) => {
            tracing::info!(pid, port, "worker ready");
            tokio::spawn(forward_output(lines, pid, "stdout"));
            Ok(Worker {
                child,
                pid,
                port,
                started_at: Instant::now(),
            })
        }
        Ok(None) => {
            // stdout closed without an announcement: the worker is on its way out
            let code = match tokio::time::timeout(config.grace_timeout(), child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => {
                    terminate(&mut child, pid, config.grace_timeout()).await;
                    None
                }
            };
            Err(SupervisorError::ExitedBeforeReady { code })
        }
        Err(_) => {
            tracing::warn!(pid, timeout_ms = config.startup_timeout_ms, "worker never announced its port");
            terminate(&mut child, pid, config.grace_timeout()).await;
            Err(SupervisorError::StartupTimeout {
                timeout_ms: config.startup_timeout_ms,
            })
        }
    }
}

/// Read stdout until a `<prefix><port>` line shows up. `None` means stdout closed.
async fn read_ready_port(lines: &mut Lines<BufReader<ChildStdout>>, prefix: &str) -> Option<u16> {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed reading worker stdout");
                return None;
            }
        };
        let Some(rest) = line.trim().strip_prefix(prefix) else {
            tracing::debug!(line = %line, "worker output before ready");
            continue;
        };
        match rest.trim().parse::<u16>() {
            Ok(port) if port != 0 => return Some(port),
            _ => tracing::warn!(line = %line, "ignoring malformed ready line"),
        }
    }
}

async fn forward_output<R>(mut lines: Lines<BufReader<R>>, pid: u32, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(pid, stream, "{line}");
    }
}

/// Ask the worker to exit, escalating to a kill only once `grace` has elapsed.
///
/// The grace timer and the exit wait race in one `select!`; whichever loses is
/// dropped, so a worker that exits in time never receives a kill.
pub(crate) async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> StopOutcome {
    if let Ok(Some(status)) = child.try_wait() {
        return StopOutcome::AlreadyExited {
            code: status.code(),
        };
    }

    request_exit(pid);
    let started = Instant::now();

    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            tracing::info!(pid, ?code, elapsed_ms = started.elapsed().as_millis() as u64, "worker exited gracefully");
            StopOutcome::Graceful { code }
        }
        _ = tokio::time::sleep(grace) => {
            tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "grace period elapsed, killing worker");
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid, error = %e, "kill failed, worker likely gone");
            }
            let _ = child.wait().await;
            StopOutcome::Forced
        }
    }
}

#[cfg(unix)]
fn request_exit(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    tracing::info!(pid, "sending SIGTERM to worker");
    if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed, worker likely gone");
    }
}

#[cfg(not(unix))]
fn request_exit(pid: u32) {
    // No polite termination request exists here; the grace period still applies.
    tracing::debug!(pid, "no termination signal on this platform, waiting out grace period");
}
