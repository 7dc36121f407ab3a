//! Application lifecycle.
//!
//! [`App::start`] brings the components up in dependency order and awaits each
//! one, so a failed start is an error at the call site rather than a task dying
//! in the background. [`App::shutdown`] tears them down in reverse.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::bridge::{BridgeError, PresentationBridge, PresentationCall};
use crate::config::WardenConfig;
use crate::graph::{DeltaItem, DeltaSubscription, GraphStore};
use crate::layout::{LayoutStore, SharedLayout};
use crate::ports::PortRegistry;
use crate::server::ControlPlane;
use crate::stream::{Endpoint, EndpointResolver, EventStreamGateway, StreamSubscription};
use crate::supervisor::{ProcessState, Supervisor, SupervisorError};
use crate::tools::ToolContext;

pub const CONTROL_PLANE_SERVICE: &str = "control-plane";
pub const WORKER_SERVICE: &str = "worker";

pub struct App {
    registry: Arc<PortRegistry>,
    supervisor: Arc<Supervisor>,
    control: ControlPlane,
    stream: StreamSubscription,
    graph: Arc<GraphStore>,
    layout: SharedLayout,
    bridge: Arc<PresentationBridge>,
    tasks: Vec<JoinHandle<()>>,
}

/// Hand one call to the bridge. A refused call is counted there and reported
/// to the presentation layer once it drains.
fn forward(bridge: &PresentationBridge, channel: &str, payload: serde_json::Value) -> Result<(), BridgeError> {
    bridge.dispatch(PresentationCall::new(channel, payload)).map(|_| ())
}

impl App {
    pub async fn start(config: WardenConfig, bridge: Arc<PresentationBridge>) -> Result<Self> {
        let registry_path = config.resolved_registry_path();
        let registry = Arc::new(
            PortRegistry::from_config(&config.ports, &registry_path)
                .context("invalid port registry configuration")?,
        );
        tracing::info!(path = %registry_path.display(), "port registry ready");

        // the worker gets a port from the range; it may still announce another
        let lease = registry
            .acquire(WORKER_SERVICE)
            .context("could not lease a port for the worker")?;
        let mut worker = config.worker.clone();
        if !worker.port_env.is_empty() {
            worker.env.insert(worker.port_env.clone(), lease.port.to_string());
        }
        let supervisor = match Supervisor::start(worker).await {
            Ok(supervisor) => Arc::new(supervisor),
            Err(e) => {
                if let Err(release) = registry.release(WORKER_SERVICE) {
                    tracing::warn!(error = %release, "could not release worker lease");
                }
                return Err(e).context("worker failed to start");
            }
        };
        let mut tasks = Vec::new();
        tasks.push(spawn_worker_watch(&supervisor, &registry, &bridge));
        {
            let bridge = Arc::clone(&bridge);
            supervisor.on_exit(move |report| {
                let _ = forward(&bridge, "worker-exit", json!(report));
            });
        }

        let graph = GraphStore::new(config.graph.broadcast_capacity);
        let layout = LayoutStore::shared();
        let tools = ToolContext {
            graph: Arc::clone(&graph),
            layout: Arc::clone(&layout),
            registry: Arc::clone(&registry),
            worker: Some(supervisor.subscribe()),
            presentation: Some(Arc::clone(&bridge)),
        };
        let control = ControlPlane::bind(&config.control_plane, tools)
            .await
            .context("failed to bind control plane")?;
        let control_port = control.local_addr().port();
        if let Err(e) = registry.record(CONTROL_PLANE_SERVICE, control_port) {
            tracing::warn!(error = %e, "could not record control plane port");
        }

        let gateway = EventStreamGateway::http(&config.stream).context("failed to build stream client")?;
        let status = supervisor.subscribe();
        let host = config.stream.host.clone();
        let resolver: Arc<dyn EndpointResolver> = Arc::new(move || {
            status
                .borrow()
                .live_port()
                .map(|port| Endpoint::new(host.clone(), port))
        });
        let stream = {
            let bridge = Arc::clone(&bridge);
            gateway.connect(resolver, move |event| {
                let _ = forward(&bridge, "stream", event.to_json());
            })
        };

        tasks.push(spawn_delta_pump(&graph, &bridge));
        {
            let bridge = Arc::clone(&bridge);
            let mut layout = layout.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            layout.subscribe(move |mode| {
                let _ = forward(&bridge, "layout-mode", json!({ "mode": mode }));
            });
        }

        tracing::info!(control_port, "warden started");
        Ok(Self {
            registry,
            supervisor,
            control,
            stream,
            graph,
            layout,
            bridge,
            tasks,
        })
    }

    pub fn control_addr(&self) -> std::net::SocketAddr {
        self.control.local_addr()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    pub fn layout(&self) -> &SharedLayout {
        &self.layout
    }

    pub fn bridge(&self) -> &Arc<PresentationBridge> {
        &self.bridge
    }

    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.stream.disconnect();
        for task in &self.tasks {
            task.abort();
        }
        self.control.shutdown().await;

        let outcome = self.supervisor.shutdown().await;
        tracing::info!(?outcome, "worker stopped");

        for service in [CONTROL_PLANE_SERVICE, WORKER_SERVICE] {
            if let Err(e) = self.registry.release(service) {
                tracing::warn!(service, error = %e, "could not release port lease");
            }
        }
        tracing::info!("shutdown complete");
    }
}

/// Keep the worker's registry lease current and surface give-ups.
fn spawn_worker_watch(
    supervisor: &Supervisor,
    registry: &Arc<PortRegistry>,
    bridge: &Arc<PresentationBridge>,
) -> JoinHandle<()> {
    let mut status = supervisor.subscribe();
    let registry = Arc::clone(registry);
    let bridge = Arc::clone(bridge);

    tokio::spawn(async move {
        let mut recorded: Option<u16> = None;
        loop {
            let current = status.borrow_and_update().clone();
            let _ = forward(&bridge, "worker-status", json!(current));

            if current.given_up {
                let err = SupervisorError::GivenUp {
                    crashes: current.crash_count,
                };
                tracing::error!(error = %err, "worker is down for good");
            }

            if current.state == ProcessState::Running && current.port != recorded {
                if let Some(port) = current.port {
                    let registry = Arc::clone(&registry);
                    let outcome = tokio::task::spawn_blocking(move || registry.record(WORKER_SERVICE, port)).await;
                    match outcome {
                        Ok(Ok(_)) => recorded = Some(port),
                        Ok(Err(e)) => tracing::warn!(error = %e, "could not record worker port"),
                        Err(e) => tracing::warn!(error = %e, "registry task failed"),
                    }
                }
            }

            if status.changed().await.is_err() {
                return;
            }
        }
    })
}

/// Relay graph deltas. Once a delta is refused the presentation copy has a
/// gap, so deltas stop until a full snapshot has been handed over; that is
/// retried on the next delta or attach the bridge can take.
fn spawn_delta_pump(graph: &Arc<GraphStore>, bridge: &Arc<PresentationBridge>) -> JoinHandle<()> {
    let mut subscription = graph.subscribe("presentation");
    let bridge = Arc::clone(bridge);
    let mut attachments = bridge.attachments();

    tokio::spawn(async move {
        let mut stale = false;
        loop {
            tokio::select! {
                item = subscription.next() => {
                    let Some(item) = item else { return };
                    if stale {
                        stale = !send_resync(&bridge, &mut subscription);
                        continue;
                    }
                    let sent = match item {
                        DeltaItem::Delta(delta) => forward(&bridge, "graph-delta", json!(delta)),
                        DeltaItem::Resynced(snapshot) => forward(&bridge, "graph-resync", json!(snapshot)),
                    };
                    if let Err(e) = sent {
                        tracing::warn!(
                            error = %e,
                            sequence = subscription.last_sequence(),
                            "graph deltas suspended until a resync is delivered"
                        );
                        stale = true;
                    }
                }
                changed = attachments.changed(), if stale => {
                    if changed.is_err() {
                        return;
                    }
                    stale = !send_resync(&bridge, &mut subscription);
                }
            }
        }
    })
}

fn send_resync(bridge: &PresentationBridge, subscription: &mut DeltaSubscription) -> bool {
    if !bridge.has_room() {
        return false;
    }
    let snapshot = subscription.request_resync();
    match forward(bridge, "graph-resync", json!(snapshot)) {
        Ok(()) => {
            tracing::info!(sequence = snapshot.sequence, "presentation graph resynced");
            true
        }
        Err(_) => false,
    }
}
