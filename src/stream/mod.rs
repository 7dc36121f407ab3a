//! Worker event stream relay.
//!
//! [`EventStreamGateway::connect`] keeps one subscription to the worker's
//! server-sent event stream alive. Every (re)connect attempt asks the
//! [`EndpointResolver`] for the worker's *current* port, because a supervisor
//! restart usually moves it. Failures back off exponentially and a successful
//! open resets the backoff. Connections are opened strictly one after another
//! on a single task, so a subscription never holds two at once.

pub mod sse;

pub use sse::HttpSseConnector;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::StreamConfig;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("worker endpoint is not available")]
    NoEndpoint,

    #[error("connecting to {endpoint} timed out after {timeout_ms} ms")]
    ConnectTimeout { endpoint: Endpoint, timeout_ms: u64 },

    #[error("stream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream endpoint answered with HTTP {status}")]
    Status { status: u16 },

    #[error("stream closed by the worker")]
    Closed,

    #[error("stream frame exceeded {limit} bytes")]
    Oversized { limit: usize },
}

/// The fixed set of event names the worker emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PhaseStarted,
    PhaseComplete,
    ActionApplied,
    Error,
    RateLimitError,
    WorkflowComplete,
    WorkflowFailed,
    ConnectionOpen,
    ConnectionLost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseStarted => "phase-started",
            Self::PhaseComplete => "phase-complete",
            Self::ActionApplied => "action-applied",
            Self::Error => "error",
            Self::RateLimitError => "rate-limit-error",
            Self::WorkflowComplete => "workflow-complete",
            Self::WorkflowFailed => "workflow-failed",
            Self::ConnectionOpen => "connection-open",
            Self::ConnectionLost => "connection-lost",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase-started" => Ok(Self::PhaseStarted),
            "phase-complete" => Ok(Self::PhaseComplete),
            "action-applied" => Ok(Self::ActionApplied),
            "error" => Ok(Self::Error),
            "rate-limit-error" => Ok(Self::RateLimitError),
            "workflow-complete" => Ok(Self::WorkflowComplete),
            "workflow-failed" => Ok(Self::WorkflowFailed),
            "connection-open" => Ok(Self::ConnectionOpen),
            "connection-lost" => Ok(Self::ConnectionLost),
            _ => Err(format!("unknown event kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Errored,
}

/// The subscription's view of its connection. Replaced whenever the endpoint changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamConnection {
    pub endpoint: Option<Endpoint>,
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub last_good_port: Option<u16>,
}

/// What the subscriber's callback receives.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// First connection attempt of this subscription.
    Connecting { endpoint: Option<Endpoint> },
    ConnectionOpen { endpoint: Endpoint },
    /// An attempt failed or an open stream dropped; a retry is scheduled.
    ConnectionLost {
        error: String,
        attempt: u32,
        retry_in: Duration,
    },
    Event(StreamEvent),
}

impl GatewayEvent {
    /// JSON form handed to the presentation layer.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Connecting { endpoint } => serde_json::json!({
                "kind": "connecting",
                "endpoint": endpoint,
            }),
            Self::ConnectionOpen { endpoint } => serde_json::json!({
                "kind": EventKind::ConnectionOpen,
                "endpoint": endpoint,
            }),
            Self::ConnectionLost {
                error,
                attempt,
                retry_in,
            } => serde_json::json!({
                "kind": EventKind::ConnectionLost,
                "error": error,
                "attempt": attempt,
                "retry_in_ms": retry_in.as_millis() as u64,
            }),
            Self::Event(event) => serde_json::json!({
                "kind": event.kind,
                "payload": event.payload,
                "delivered_at": event.delivered_at,
            }),
        }
    }
}

/// Looks up where the worker's stream currently lives.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self) -> Option<Endpoint>;
}

impl<F> EndpointResolver for F
where
    F: Fn() -> Option<Endpoint> + Send + Sync,
{
    fn resolve(&self) -> Option<Endpoint> {
        self()
    }
}

/// An open stream yielding decoded events. `Ok(None)` means the peer closed it.
pub trait EventSource: Send {
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<StreamEvent>, StreamError>>;
}

pub trait StreamConnector: Send + Sync {
    fn open<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<Box<dyn EventSource>, StreamError>>;
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub connect_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&StreamConfig> for GatewayOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
    }
}

pub struct EventStreamGateway {
    connector: Arc<dyn StreamConnector>,
    options: GatewayOptions,
}

impl EventStreamGateway {
    pub fn new(connector: Arc<dyn StreamConnector>, options: GatewayOptions) -> Self {
        Self { connector, options }
    }

    /// Gateway speaking SSE over HTTP, configured from `[stream]`.
    pub fn http(config: &StreamConfig) -> Result<Self, StreamError> {
        let connector = HttpSseConnector::new(&config.path, Duration::from_millis(config.connect_timeout_ms))?;
        Ok(Self::new(Arc::new(connector), GatewayOptions::from(config)))
    }

    /// Start a subscription. Events flow to `on_event` until the returned handle
    /// is disconnected or dropped.
    pub fn connect(
        &self,
        resolver: Arc<dyn EndpointResolver>,
        on_event: impl FnMut(GatewayEvent) + Send + 'static,
    ) -> StreamSubscription {
        let gate: Gate = Arc::new(Mutex::new(false));
        let (state_tx, state_rx) = watch::channel(StreamConnection {
            endpoint: None,
            state: ConnectionState::Connecting,
            consecutive_failures: 0,
            last_good_port: None,
        });
        let emitter = Emitter {
            gate: Arc::clone(&gate),
            on_event: Box::new(on_event),
        };
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.connector),
            resolver,
            self.options.clone(),
            emitter,
            state_tx,
        ));
        StreamSubscription {
            gate,
            task: Mutex::new(Some(task)),
            state: state_rx,
        }
    }
}

/// Closed flag shared by the handle and its task. The emitter holds the lock
/// while the callback runs, so `disconnect` waits out an in-flight callback.
type Gate = Arc<Mutex<bool>>;

fn lock_gate(gate: &Mutex<bool>) -> MutexGuard<'_, bool> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StreamSubscription {
    gate: Gate,
    task: Mutex<Option<JoinHandle<()>>>,
    state: watch::Receiver<StreamConnection>,
}

impl StreamSubscription {
    /// Cancel any pending reconnect and close the open connection. Idempotent;
    /// no event is delivered once this returns.
    ///
    /// Must not be called from inside the subscription's own callback.
    pub fn disconnect(&self) {
        {
            let mut closed = lock_gate(&self.gate);
            if *closed {
                return;
            }
            *closed = true;
        }
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        tracing::info!("event stream subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        *lock_gate(&self.gate)
    }

    pub fn connection(&self) -> StreamConnection {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<StreamConnection> {
        self.state.clone()
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Emitter {
    gate: Gate,
    on_event: Box<dyn FnMut(GatewayEvent) + Send>,
}

impl Emitter {
    fn is_closed(&self) -> bool {
        *lock_gate(&self.gate)
    }

    /// Deliver unless closed. Returns whether the subscription is still open.
    fn emit(&mut self, event: GatewayEvent) -> bool {
        let closed = lock_gate(&self.gate);
        if *closed {
            return false;
        }
        (self.on_event)(event);
        true
    }
}

async fn run_subscription(
    connector: Arc<dyn StreamConnector>,
    resolver: Arc<dyn EndpointResolver>,
    options: GatewayOptions,
    mut emitter: Emitter,
    state: watch::Sender<StreamConnection>,
) {
    let mut backoff = Backoff::new(options.base_delay, options.max_delay);
    let mut first_attempt = true;

    loop {
        if emitter.is_closed() {
            return;
        }

        // never reuse a stale endpoint: the worker may have restarted elsewhere
        let endpoint = resolver.resolve();
        if first_attempt {
            emitter.emit(GatewayEvent::Connecting {
                endpoint: endpoint.clone(),
            });
            first_attempt = false;
        }
        set_connecting(&state, endpoint.as_ref(), backoff.failures());

        let failure = match endpoint {
            None => StreamError::NoEndpoint,
            Some(endpoint) => {
                let opened = tokio::time::timeout(options.connect_timeout, connector.open(&endpoint)).await;
                match opened {
                    Err(_) => StreamError::ConnectTimeout {
                        endpoint,
                        timeout_ms: options.connect_timeout.as_millis() as u64,
                    },
                    Ok(Err(e)) => e,
                    Ok(Ok(mut source)) => {
                        backoff.reset();
                        state.send_modify(|c| {
                            c.state = ConnectionState::Open;
                            c.consecutive_failures = 0;
                            c.last_good_port = Some(endpoint.port);
                        });
                        tracing::info!(endpoint = %endpoint, "event stream connected");
                        emitter.emit(GatewayEvent::ConnectionOpen {
                            endpoint: endpoint.clone(),
                        });

                        loop {
                            match source.next_event().await {
                                Ok(Some(event)) => {
                                    if !emitter.emit(GatewayEvent::Event(event)) {
                                        return;
                                    }
                                }
                                Ok(None) => break StreamError::Closed,
                                Err(e) => break e,
                            }
                        }
                    }
                }
            }
        };

        if emitter.is_closed() {
            return;
        }

        let retry_in = backoff.next_delay();
        let attempt = backoff.failures();
        state.send_modify(|c| {
            c.state = ConnectionState::Errored;
            c.consecutive_failures = attempt;
        });
        tracing::warn!(
            error = %failure,
            attempt,
            retry_in_ms = retry_in.as_millis() as u64,
            "event stream unavailable, reconnecting"
        );
        emitter.emit(GatewayEvent::ConnectionLost {
            error: failure.to_string(),
            attempt,
            retry_in,
        });

        tokio::time::sleep(retry_in).await;
    }
}

/// Mark an attempt in progress, swapping in a fresh record if the endpoint moved.
fn set_connecting(state: &watch::Sender<StreamConnection>, endpoint: Option<&Endpoint>, failures: u32) {
    let current = state.borrow().clone();
    if current.endpoint.as_ref() != endpoint {
        if let (Some(old), Some(new)) = (current.endpoint.as_ref(), endpoint) {
            tracing::info!(from = %old, to = %new, "worker stream endpoint changed");
        }
        state.send_replace(StreamConnection {
            endpoint: endpoint.cloned(),
            state: ConnectionState::Connecting,
            consecutive_failures: failures,
            last_good_port: current.last_good_port,
        });
    } else {
        state.send_modify(|c| c.state = ConnectionState::Connecting);
    }
}
