//! Loopback HTTP control plane.
//!
//! Serves `POST /tools/call`, `GET /tools`, and `GET /health` on `127.0.0.1`.
//! Every tool call runs in its own task under a deadline, so a panicking or
//! stuck handler costs its own caller a structured error and nothing else.
//! Oversized bodies are refused by the body limit before JSON parsing starts.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ControlPlaneConfig;
use crate::tools::{describe_tools, ToolContext, ToolError, ToolRequest};

/// Raw tool call body; decoded into a [`ToolRequest`] after the name is checked.
#[derive(Debug, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    json!({})
}

/// Per-request bookkeeping, carried through the logs.
#[derive(Debug, Clone)]
pub struct ControlSession {
    pub id: uuid::Uuid,
    pub peer: SocketAddr,
    pub arrived_at: DateTime<Utc>,
}

impl ControlSession {
    fn open(peer: SocketAddr) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            peer,
            arrived_at: Utc::now(),
        }
    }
}

/// Sliding one-second window over accepted calls. A limit of 0 disables it.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn per_second(limit: usize) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
            hits: VecDeque::new(),
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        while let Some(oldest) = self.hits.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

/// How an isolated handler run ended, when it did not produce a value.
#[derive(Debug, PartialEq, Eq)]
pub enum Isolation {
    TimedOut,
    Panicked,
    Cancelled,
}

/// Run `fut` on its own task; abort it if `deadline` passes first.
pub async fn run_isolated<F, T>(deadline: Duration, fut: F) -> Result<T, Isolation>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_panic() => Err(Isolation::Panicked),
        Ok(Err(_)) => Err(Isolation::Cancelled),
        Err(_) => {
            handle.abort();
            Err(Isolation::TimedOut)
        }
    }
}

struct ControlState {
    tools: ToolContext,
    limiter: Mutex<RateLimiter>,
    request_timeout: Duration,
    started_at: Instant,
    active: AtomicUsize,
}

/// Decrements the active-session count when the handler returns or is dropped.
struct ActiveSession<'a>(&'a AtomicUsize);

impl<'a> ActiveSession<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": code, "message": message.into() }))).into_response()
}

fn tool_error_status(e: &ToolError) -> StatusCode {
    match e {
        ToolError::UnknownTool(_) => StatusCode::BAD_REQUEST,
        ToolError::InvalidArguments(_) | ToolError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ToolError::NotFound(_) => StatusCode::NOT_FOUND,
        ToolError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ToolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn call_tool(
    State(state): State<Arc<ControlState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<ToolCall>, JsonRejection>,
) -> Response {
    let session = ControlSession::open(peer);
    let _active = ActiveSession::enter(&state.active);

    let call = match body {
        Ok(Json(call)) => call,
        Err(rejection) => {
            let status = rejection.status();
            let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
                "payload_too_large"
            } else {
                "bad_request"
            };
            tracing::warn!(session = %session.id, peer = %session.peer, %status, "tool call rejected");
            return error_response(status, code, rejection.body_text());
        }
    };

    let allowed = state
        .limiter
        .lock()
        .map(|mut limiter| limiter.try_acquire(Instant::now()))
        .unwrap_or(true);
    if !allowed {
        tracing::warn!(session = %session.id, tool = %call.tool, "tool call rate limited");
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many tool calls, retry shortly",
        );
    }

    let request = match ToolRequest::parse(&call.tool, call.arguments) {
        Ok(request) => request,
        Err(e) => return error_response(tool_error_status(&e), e.code(), e.to_string()),
    };

    let tools = state.tools.clone();
    let outcome = run_isolated(state.request_timeout, async move { tools.execute(request).await }).await;
    let elapsed_ms = Utc::now()
        .signed_duration_since(session.arrived_at)
        .num_milliseconds();

    match outcome {
        Ok(Ok(value)) => {
            tracing::debug!(session = %session.id, tool = %call.tool, elapsed_ms, "tool call complete");
            Json(value).into_response()
        }
        Ok(Err(e)) => {
            tracing::info!(session = %session.id, tool = %call.tool, error = %e, "tool call failed");
            error_response(tool_error_status(&e), e.code(), e.to_string())
        }
        Err(Isolation::TimedOut) => {
            tracing::error!(session = %session.id, tool = %call.tool, elapsed_ms, "tool call timed out, aborted");
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                format!("tool call exceeded {} ms", state.request_timeout.as_millis()),
            )
        }
        Err(Isolation::Panicked) | Err(Isolation::Cancelled) => {
            tracing::error!(session = %session.id, tool = %call.tool, "tool handler crashed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", "tool handler failed")
        }
    }
}

async fn list_tools() -> Json<Value> {
    Json(json!({ "tools": describe_tools() }))
}

async fn health(State(state): State<Arc<ControlState>>) -> Json<Value> {
    let worker = state.tools.worker.as_ref().map(|w| w.borrow().clone());
    let degraded = worker.as_ref().is_some_and(|w| w.given_up);
    let presentation = state.tools.presentation.as_ref().map(|bridge| bridge.stats());
    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_sessions": state.active.load(Ordering::SeqCst),
        "graph_sequence": state.tools.graph.broadcaster().current_sequence(),
        "worker": worker,
        "presentation": presentation,
    }))
}

pub struct ControlPlane {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    drain_timeout: Duration,
}

impl ControlPlane {
    /// Bind `127.0.0.1:<port>` (0 picks a free port) and start serving.
    pub async fn bind(config: &ControlPlaneConfig, tools: ToolContext) -> std::io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let request_timeout = Duration::from_millis(config.request_timeout_ms);

        let state = Arc::new(ControlState {
            tools,
            limiter: Mutex::new(RateLimiter::per_second(config.max_requests_per_second)),
            request_timeout,
            started_at: Instant::now(),
            active: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route("/tools/call", post(call_tool))
            .route("/tools", get(list_tools))
            .route("/health", get(health))
            .layer(DefaultBodyLimit::max(config.max_body_bytes))
            .with_state(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
        });

        tracing::info!(addr = %local_addr, "control plane listening");
        Ok(Self {
            local_addr,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            drain_timeout: request_timeout + Duration::from_secs(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let in-flight calls finish (bounded by the request
    /// timeout), then drop the listener. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        let Some(mut task) = task else {
            return;
        };
        match tokio::time::timeout(self.drain_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => tracing::info!(addr = %self.local_addr, "control plane stopped"),
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "control plane server error"),
            Ok(Err(e)) => tracing::error!(error = %e, "control plane task failed"),
            Err(_) => {
                tracing::warn!("control plane drain timed out, aborting");
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_window_slides() {
        let mut limiter = RateLimiter::per_second(2);
        let t0 = Instant::now();
        assert!(limiter.try_acquire(t0));
        assert!(limiter.try_acquire(t0 + Duration::from_millis(100)));
        assert!(!limiter.try_acquire(t0 + Duration::from_millis(200)));
        // first hit has aged out
        assert!(limiter.try_acquire(t0 + Duration::from_millis(1000)));
        assert!(!limiter.try_acquire(t0 + Duration::from_millis(1050)));
    }

    #[test]
    fn zero_limit_disables_limiting() {
        let mut limiter = RateLimiter::per_second(0);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(limiter.try_acquire(now));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_handler_times_out() {
        let outcome = run_isolated(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .await;
        assert_eq!(outcome, Err(Isolation::TimedOut));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let outcome: Result<(), Isolation> = run_isolated(Duration::from_secs(5), async {
            panic!("handler blew up");
        })
        .await;
        assert_eq!(outcome, Err(Isolation::Panicked));

        let ok = run_isolated(Duration::from_secs(5), async { 7 }).await;
        assert_eq!(ok, Ok(7));
    }
}
