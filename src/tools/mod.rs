//! Control-plane tools.
//!
//! Tool calls arrive as `{"tool": "<name>", "arguments": {...}}` and are decoded
//! into the closed [`ToolRequest`] enum: an unknown name is rejected before the
//! arguments are looked at, and argument structs refuse unknown or missing
//! fields. [`ToolContext`] carries the state the tools operate on.

pub mod graph;
pub mod layout;
pub mod status;

use std::collections::HashSet;
use std::sync::{Arc, MutexGuard};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;

use crate::bridge::PresentationBridge;
use crate::graph::{GraphError, GraphStore};
use crate::layout::{
    LayoutSnapshot, LayoutStore, Position, PositionTarget, SharedLayout, ViewMode,
};
use crate::ports::{PortRegistry, RegistryError};
use crate::supervisor::ManagedProcess;
use graph::{
    AddEdgeParams, AddNodeParams, DeleteEdgeParams, DeleteNodeParams, GetGraphParams,
    UpdateNodeParams,
};
use layout::{CycleLayoutParams, LayoutModeParams};
use status::{DiscoverServiceParams, WorkerStatusParams};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::NotFound(_) => "not_found",
            Self::Rejected(_) => "invalid_input",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<GraphError> for ToolError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::NodeNotFound(_) | GraphError::EdgeNotFound(_) => Self::NotFound(e.to_string()),
            GraphError::Invalid(_) => Self::Rejected(e.to_string()),
        }
    }
}

impl From<RegistryError> for ToolError {
    fn from(e: RegistryError) -> Self {
        Self::Internal(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolRequest {
    AddNode(AddNodeParams),
    UpdateNode(UpdateNodeParams),
    DeleteNode(DeleteNodeParams),
    AddEdge(AddEdgeParams),
    DeleteEdge(DeleteEdgeParams),
    GetGraph(GetGraphParams),
    WorkerStatus(WorkerStatusParams),
    DiscoverService(DiscoverServiceParams),
    LayoutMode(LayoutModeParams),
    CycleLayout(CycleLayoutParams),
}

/// Catalogue entry served by `GET /tools`.
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    schema: fn() -> schemars::Schema,
}

#[derive(Debug, Serialize)]
pub struct ToolDescription {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: schemars::Schema,
}

fn schema_of<T: JsonSchema>() -> schemars::Schema {
    schemars::schema_for!(T)
}

pub const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "add_node",
        description: "Create a node. Publishes a node create delta.",
        schema: schema_of::<AddNodeParams>,
    },
    ToolSpec {
        name: "update_node",
        description: "Change a node's title and/or content.",
        schema: schema_of::<UpdateNodeParams>,
    },
    ToolSpec {
        name: "delete_node",
        description: "Delete a node together with every edge touching it.",
        schema: schema_of::<DeleteNodeParams>,
    },
    ToolSpec {
        name: "add_edge",
        description: "Connect two existing nodes.",
        schema: schema_of::<AddEdgeParams>,
    },
    ToolSpec {
        name: "delete_edge",
        description: "Remove an edge.",
        schema: schema_of::<DeleteEdgeParams>,
    },
    ToolSpec {
        name: "get_graph",
        description: "Full graph snapshot with the sequence number it reflects.",
        schema: schema_of::<GetGraphParams>,
    },
    ToolSpec {
        name: "worker_status",
        description: "Supervised worker state: pid, port, crash count, restart schedule.",
        schema: schema_of::<WorkerStatusParams>,
    },
    ToolSpec {
        name: "discover_service",
        description: "Look up a service's live port lease in the registry.",
        schema: schema_of::<DiscoverServiceParams>,
    },
    ToolSpec {
        name: "layout_mode",
        description: "Read or switch the graph view mode.",
        schema: schema_of::<LayoutModeParams>,
    },
    ToolSpec {
        name: "cycle_layout",
        description: "Advance to the next view mode (default, clustered, radial).",
        schema: schema_of::<CycleLayoutParams>,
    },
];

pub fn describe_tools() -> Vec<ToolDescription> {
    TOOLS
        .iter()
        .map(|spec| ToolDescription {
            name: spec.name,
            description: spec.description,
            input_schema: (spec.schema)(),
        })
        .collect()
}

impl ToolRequest {
    /// Decode a call. Unknown tool names and bad arguments are told apart.
    pub fn parse(tool: &str, arguments: Value) -> Result<Self, ToolError> {
        if !TOOLS.iter().any(|spec| spec.name == tool) {
            return Err(ToolError::UnknownTool(tool.to_string()));
        }
        serde_json::from_value(json!({ "tool": tool, "arguments": arguments }))
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddNode(_) => "add_node",
            Self::UpdateNode(_) => "update_node",
            Self::DeleteNode(_) => "delete_node",
            Self::AddEdge(_) => "add_edge",
            Self::DeleteEdge(_) => "delete_edge",
            Self::GetGraph(_) => "get_graph",
            Self::WorkerStatus(_) => "worker_status",
            Self::DiscoverService(_) => "discover_service",
            Self::LayoutMode(_) => "layout_mode",
            Self::CycleLayout(_) => "cycle_layout",
        }
    }
}

/// Shared state the tools operate on.
#[derive(Clone)]
pub struct ToolContext {
    pub graph: Arc<GraphStore>,
    pub layout: SharedLayout,
    pub registry: Arc<PortRegistry>,
    /// Absent when no worker is being supervised.
    pub worker: Option<watch::Receiver<ManagedProcess>>,
    /// Reported by `/health`; absent when nothing presents the state.
    pub presentation: Option<Arc<PresentationBridge>>,
}

impl ToolContext {
    pub async fn execute(&self, request: ToolRequest) -> Result<Value, ToolError> {
        tracing::info!(tool = request.name(), "tool called");
        match request {
            ToolRequest::AddNode(p) => {
                let node = self
                    .graph
                    .add_node(&p.title, &p.content, p.parent_id.as_deref())?;
                to_value(&node)
            }
            ToolRequest::UpdateNode(p) => {
                let node = self
                    .graph
                    .update_node(&p.id, p.title.as_deref(), p.content.as_deref())?;
                to_value(&node)
            }
            ToolRequest::DeleteNode(p) => {
                let node = self.graph.delete_node(&p.id)?;
                Ok(json!({ "deleted": node.id }))
            }
            ToolRequest::AddEdge(p) => {
                let edge = self
                    .graph
                    .add_edge(&p.source, &p.target, p.label.as_deref())?;
                to_value(&edge)
            }
            ToolRequest::DeleteEdge(p) => {
                let edge = self.graph.delete_edge(&p.id)?;
                Ok(json!({ "deleted": edge.id }))
            }
            ToolRequest::GetGraph(_) => to_value(&self.graph.snapshot()),
            ToolRequest::WorkerStatus(_) => match &self.worker {
                Some(status) => {
                    let current = status.borrow().clone();
                    to_value(&current)
                }
                None => Err(ToolError::Unavailable("no worker is supervised".into())),
            },
            ToolRequest::DiscoverService(p) => self.discover(p.service).await,
            ToolRequest::LayoutMode(p) => match p.mode {
                Some(mode) => Ok(self.switch_layout(Some(mode), p.positions)),
                None => {
                    let layout = self.layout();
                    Ok(json!({ "mode": layout.mode(), "has_snapshot": layout.has_snapshot() }))
                }
            },
            ToolRequest::CycleLayout(p) => Ok(self.switch_layout(None, p.positions)),
        }
    }

    async fn discover(&self, service: String) -> Result<Value, ToolError> {
        // registry access is blocking file I/O under a file lock
        let registry = Arc::clone(&self.registry);
        let lookup = service.clone();
        let lease = tokio::task::spawn_blocking(move || registry.discover(&lookup))
            .await
            .map_err(|e| ToolError::Internal(format!("registry task failed: {e}")))??;
        match lease {
            Some(lease) => to_value(&lease),
            None => Err(ToolError::NotFound(format!("no live lease for service: {service}"))),
        }
    }

    fn layout(&self) -> MutexGuard<'_, LayoutStore> {
        self.layout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `target` (or the next mode), saving positions on the way out of
    /// the default view and restoring them on the way back in.
    fn switch_layout(&self, target: Option<ViewMode>, positions: Option<LayoutSnapshot>) -> Value {
        let live: HashSet<String> = self
            .graph
            .snapshot()
            .nodes
            .into_iter()
            .map(|n| n.id)
            .collect();

        let mut layout = self.layout();
        let from = layout.mode();
        let to = target.unwrap_or_else(|| from.next());
        if to == from {
            return json!({ "mode": to, "changed": false, "has_snapshot": layout.has_snapshot() });
        }

        if from == ViewMode::Default {
            if let Some(positions) = positions {
                layout.save(positions);
            }
        }
        match target {
            Some(mode) => {
                layout.set_mode(mode);
            }
            None => {
                layout.cycle();
            }
        }

        if to != ViewMode::Default {
            return json!({ "mode": to, "previous": from, "changed": true, "has_snapshot": layout.has_snapshot() });
        }

        let mut placed = LivePositions {
            live,
            placed: LayoutSnapshot::new(),
        };
        let report = layout.restore(&mut placed);
        json!({
            "mode": to,
            "previous": from,
            "changed": true,
            "restored": placed.placed,
            "applied": report.applied,
            "skipped": report.skipped,
        })
    }
}

/// Restore target limited to nodes that still exist in the graph.
struct LivePositions {
    live: HashSet<String>,
    placed: LayoutSnapshot,
}

impl PositionTarget for LivePositions {
    fn contains(&self, node_id: &str) -> bool {
        self.live.contains(node_id)
    }

    fn set_position(&mut self, node_id: &str, position: Position) {
        self.placed.insert(node_id.to_string(), position);
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Internal(format!("serialization failed: {e}")))
}
