//! Authoritative in-memory graph and its delta stream.
//!
//! [`GraphStore`] applies node/edge mutations, publishes one [`GraphDelta`] per
//! mutation through its [`DeltaBroadcaster`], and serves full snapshots for
//! subscribers that need to resync. Mutations publish while holding the state
//! lock, so a snapshot's `sequence` always matches the deltas it contains.

pub mod delta;

pub use delta::{
    DeltaBroadcaster, DeltaItem, DeltaKind, DeltaOp, DeltaSubscription, DeltaTarget, GraphDelta,
    ResyncFn,
};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("edge not found: {0}")]
    EdgeNotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub title: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub label: Option<String>,
}

/// Full graph state as of `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub sequence: u64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Default)]
struct GraphState {
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<String, Edge>,
}

pub struct GraphStore {
    state: Mutex<GraphState>,
    broadcaster: DeltaBroadcaster,
}

const NODE_CREATE: DeltaOp = DeltaOp::new(DeltaKind::Create, DeltaTarget::Node);
const NODE_UPDATE: DeltaOp = DeltaOp::new(DeltaKind::Update, DeltaTarget::Node);
const NODE_DELETE: DeltaOp = DeltaOp::new(DeltaKind::Delete, DeltaTarget::Node);
const EDGE_CREATE: DeltaOp = DeltaOp::new(DeltaKind::Create, DeltaTarget::Edge);
const EDGE_DELETE: DeltaOp = DeltaOp::new(DeltaKind::Delete, DeltaTarget::Edge);

fn to_payload<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

impl GraphStore {
    pub fn new(broadcast_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GraphState::default()),
            broadcaster: DeltaBroadcaster::new(broadcast_capacity),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn broadcaster(&self) -> &DeltaBroadcaster {
        &self.broadcaster
    }

    pub fn add_node(
        &self,
        title: &str,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<Node, GraphError> {
        if title.trim().is_empty() {
            return Err(GraphError::Invalid("title must not be empty".into()));
        }
        let mut state = self.lock();
        if let Some(parent) = parent_id {
            if !state.nodes.contains_key(parent) {
                return Err(GraphError::NodeNotFound(parent.to_string()));
            }
        }
        let now = Utc::now();
        let node = Node {
            id: uuid::Uuid::now_v7().to_string(),
            title: title.to_string(),
            content: content.to_string(),
            parent_id: parent_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        state.nodes.insert(node.id.clone(), node.clone());
        self.broadcaster.publish(NODE_CREATE, to_payload(&node));
        Ok(node)
    }

    pub fn update_node(
        &self,
        id: &str,
        title: Option<&str>,
        content: Option<&str>,
    ) -> Result<Node, GraphError> {
        if title.is_none() && content.is_none() {
            return Err(GraphError::Invalid("nothing to update".into()));
        }
        if title.is_some_and(|t| t.trim().is_empty()) {
            return Err(GraphError::Invalid("title must not be empty".into()));
        }
        let mut state = self.lock();
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        if let Some(title) = title {
            node.title = title.to_string();
        }
        if let Some(content) = content {
            node.content = content.to_string();
        }
        node.updated_at = Utc::now();
        let node = node.clone();
        self.broadcaster.publish(NODE_UPDATE, to_payload(&node));
        Ok(node)
    }

    /// Remove a node and every edge touching it. Edge deletions are published first.
    pub fn delete_node(&self, id: &str) -> Result<Node, GraphError> {
        let mut state = self.lock();
        if !state.nodes.contains_key(id) {
            return Err(GraphError::NodeNotFound(id.to_string()));
        }
        let incident: Vec<String> = state
            .edges
            .values()
            .filter(|e| e.source == id || e.target == id)
            .map(|e| e.id.clone())
            .collect();
        for edge_id in incident {
            if let Some(edge) = state.edges.remove(&edge_id) {
                self.broadcaster.publish(EDGE_DELETE, to_payload(&edge));
            }
        }
        for child in state.nodes.values_mut() {
            if child.parent_id.as_deref() == Some(id) {
                child.parent_id = None;
            }
        }
        let node = state
            .nodes
            .remove(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        self.broadcaster
            .publish(NODE_DELETE, serde_json::json!({ "id": node.id }));
        Ok(node)
    }

    pub fn add_edge(&self, source: &str, target: &str, label: Option<&str>) -> Result<Edge, GraphError> {
        if source == target {
            return Err(GraphError::Invalid("edge must connect two different nodes".into()));
        }
        let mut state = self.lock();
        for endpoint in [source, target] {
            if !state.nodes.contains_key(endpoint) {
                return Err(GraphError::NodeNotFound(endpoint.to_string()));
            }
        }
        let edge = Edge {
            id: uuid::Uuid::now_v7().to_string(),
            source: source.to_string(),
            target: target.to_string(),
            label: label.map(str::to_string),
        };
        state.edges.insert(edge.id.clone(), edge.clone());
        self.broadcaster.publish(EDGE_CREATE, to_payload(&edge));
        Ok(edge)
    }

    pub fn delete_edge(&self, id: &str) -> Result<Edge, GraphError> {
        let mut state = self.lock();
        let edge = state
            .edges
            .remove(id)
            .ok_or_else(|| GraphError::EdgeNotFound(id.to_string()))?;
        self.broadcaster.publish(EDGE_DELETE, to_payload(&edge));
        Ok(edge)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.lock();
        GraphSnapshot {
            sequence: self.broadcaster.current_sequence(),
            nodes: state.nodes.values().cloned().collect(),
            edges: state.edges.values().cloned().collect(),
        }
    }

    /// Subscribe to deltas; gaps resync from this store's snapshot.
    pub fn subscribe(self: &Arc<Self>, consumer_id: impl Into<String>) -> DeltaSubscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        let fallback_sequence = self.broadcaster.current_sequence();
        let resync: ResyncFn = Arc::new(move || match weak.upgrade() {
            Some(store) => store.snapshot(),
            None => GraphSnapshot {
                sequence: fallback_sequence,
                nodes: Vec::new(),
                edges: Vec::new(),
            },
        });
        // take the state lock so the baseline lines up with a quiescent graph
        let _state = self.lock();
        self.broadcaster.subscribe(consumer_id, resync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_publish_one_delta_each() {
        let store = GraphStore::new(64);
        let a = store.add_node("A", "alpha", None).unwrap();
        let b = store.add_node("B", "beta", Some(&a.id)).unwrap();
        store.update_node(&a.id, None, Some("alpha v2")).unwrap();
        store.add_edge(&a.id, &b.id, Some("relates_to")).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.sequence, 4);
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.edges.len(), 1);
    }

    #[test]
    fn delete_node_cascades_edges_and_children() {
        let store = GraphStore::new(64);
        let a = store.add_node("A", "", None).unwrap();
        let b = store.add_node("B", "", Some(&a.id)).unwrap();
        store.add_edge(&a.id, &b.id, None).unwrap();

        store.delete_node(&a.id).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        assert!(snapshot.edges.is_empty());
        assert_eq!(snapshot.nodes[0].parent_id, None);
        // 3 creates + 1 edge delete + 1 node delete
        assert_eq!(snapshot.sequence, 5);
    }

    #[test]
    fn invalid_mutations_publish_nothing() {
        let store = GraphStore::new(64);
        assert!(matches!(store.add_node("  ", "", None), Err(GraphError::Invalid(_))));
        assert!(matches!(
            store.add_node("A", "", Some("nope")),
            Err(GraphError::NodeNotFound(_))
        ));
        assert!(matches!(store.delete_edge("nope"), Err(GraphError::EdgeNotFound(_))));
        assert!(matches!(
            store.update_node("nope", Some("x"), None),
            Err(GraphError::NodeNotFound(_))
        ));
        assert_eq!(store.snapshot().sequence, 0);
    }

    #[tokio::test]
    async fn subscription_resyncs_from_store_snapshot() {
        let store = GraphStore::new(1);
        let mut sub = store.subscribe("ui");
        store.add_node("A", "", None).unwrap();
        store.add_node("B", "", None).unwrap();
        store.add_node("C", "", None).unwrap();

        match sub.next().await {
            Some(DeltaItem::Resynced(snapshot)) => {
                assert_eq!(snapshot.sequence, 3);
                assert_eq!(snapshot.nodes.len(), 3);
            }
            other => panic!("expected resync, got {other:?}"),
        }
        assert_eq!(sub.last_sequence(), 3);
    }
}
