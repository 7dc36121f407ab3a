//! Sequenced fan-out of graph mutations.
//!
//! Every published [`GraphDelta`] gets the next sequence number from a single
//! counter. Delivery goes through a bounded broadcast channel, so a slow
//! subscriber never holds up the publisher or its peers: it falls behind, sees a
//! gap, and resyncs from a full snapshot instead.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::GraphSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaTarget {
    Node,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaOp {
    pub kind: DeltaKind,
    pub target: DeltaTarget,
}

impl DeltaOp {
    pub const fn new(kind: DeltaKind, target: DeltaTarget) -> Self {
        Self { kind, target }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    pub sequence: u64,
    #[serde(flatten)]
    pub op: DeltaOp,
    pub payload: serde_json::Value,
    pub origin: DateTime<Utc>,
}

/// Produces a full snapshot whose `sequence` marks the last delta it includes.
pub type ResyncFn = Arc<dyn Fn() -> GraphSnapshot + Send + Sync>;

pub struct DeltaBroadcaster {
    last_sequence: Mutex<u64>,
    tx: broadcast::Sender<GraphDelta>,
}

impl DeltaBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            last_sequence: Mutex::new(0),
            tx,
        }
    }

    /// Assign the next sequence number and send. Both happen under one lock, so
    /// channel order always matches sequence order.
    pub fn publish(&self, op: DeltaOp, payload: serde_json::Value) -> GraphDelta {
        let mut last = self
            .last_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last += 1;
        let delta = GraphDelta {
            sequence: *last,
            op,
            payload,
            origin: Utc::now(),
        };
        // no receivers is fine, deltas are not buffered for future subscribers
        let _ = self.tx.send(delta.clone());
        delta
    }

    /// Sequence number of the most recent delta, 0 before the first publish.
    pub fn current_sequence(&self) -> u64 {
        *self
            .last_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Start receiving deltas published after this call.
    pub fn subscribe(&self, consumer_id: impl Into<String>, resync: ResyncFn) -> DeltaSubscription {
        // hold the counter so no delta slips between the baseline and the receiver
        let last = self
            .last_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let rx = self.tx.subscribe();
        let consumer_id = consumer_id.into();
        tracing::debug!(consumer = %consumer_id, baseline = *last, "delta subscriber joined");
        DeltaSubscription {
            consumer_id,
            rx,
            last_sequence: *last,
            resync,
            resyncs: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeltaItem {
    Delta(GraphDelta),
    /// A gap was detected; apply this snapshot instead of the missing deltas.
    Resynced(GraphSnapshot),
}

pub struct DeltaSubscription {
    consumer_id: String,
    rx: broadcast::Receiver<GraphDelta>,
    last_sequence: u64,
    resync: ResyncFn,
    resyncs: u64,
}

impl DeltaSubscription {
    /// Next delta in sequence, or a snapshot when the stream had a gap.
    /// `None` once the broadcaster is gone.
    pub async fn next(&mut self) -> Option<DeltaItem> {
        loop {
            match self.rx.recv().await {
                Ok(delta) if delta.sequence <= self.last_sequence => {
                    // already covered by the baseline snapshot
                    continue;
                }
                Ok(delta) if delta.sequence == self.last_sequence + 1 => {
                    self.last_sequence = delta.sequence;
                    return Some(DeltaItem::Delta(delta));
                }
                Ok(delta) => {
                    tracing::warn!(
                        consumer = %self.consumer_id,
                        expected = self.last_sequence + 1,
                        got = delta.sequence,
                        "delta sequence gap, resyncing"
                    );
                    return Some(DeltaItem::Resynced(self.request_resync()));
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        consumer = %self.consumer_id,
                        missed,
                        "delta subscriber fell behind, resyncing"
                    );
                    return Some(DeltaItem::Resynced(self.request_resync()));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Fetch a full snapshot and make its sequence the new baseline.
    pub fn request_resync(&mut self) -> GraphSnapshot {
        let snapshot = (self.resync)();
        self.last_sequence = snapshot.sequence;
        self.resyncs += 1;
        snapshot
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NODE_CREATE: DeltaOp = DeltaOp::new(DeltaKind::Create, DeltaTarget::Node);

    fn fixed_snapshot(sequence: u64) -> ResyncFn {
        Arc::new(move || GraphSnapshot {
            sequence,
            nodes: Vec::new(),
            edges: Vec::new(),
        })
    }

    fn unwrap_delta(item: Option<DeltaItem>) -> GraphDelta {
        match item {
            Some(DeltaItem::Delta(d)) => d,
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_stay_contiguous() {
        let broadcaster = DeltaBroadcaster::new(16);
        let mut sub = broadcaster.subscribe("ui", fixed_snapshot(0));

        for i in 0..5 {
            broadcaster.publish(NODE_CREATE, json!({ "i": i }));
        }

        for expected in 1..=5 {
            assert_eq!(unwrap_delta(sub.next().await).sequence, expected);
        }
        assert_eq!(sub.last_sequence(), 5);
        assert_eq!(sub.resync_count(), 0);
        assert_eq!(broadcaster.current_sequence(), 5);
    }

    #[tokio::test]
    async fn late_subscriber_baseline_is_current_sequence() {
        let broadcaster = DeltaBroadcaster::new(16);
        broadcaster.publish(NODE_CREATE, json!({}));
        broadcaster.publish(NODE_CREATE, json!({}));

        let mut sub = broadcaster.subscribe("late", fixed_snapshot(0));
        assert_eq!(sub.last_sequence(), 2);

        broadcaster.publish(NODE_CREATE, json!({}));
        assert_eq!(unwrap_delta(sub.next().await).sequence, 3);
    }

    #[tokio::test]
    async fn skipped_sequence_triggers_one_resync() {
        let broadcaster = DeltaBroadcaster::new(16);
        let mut sub = broadcaster.subscribe("ui", fixed_snapshot(7));

        broadcaster.publish(NODE_CREATE, json!({}));
        // inject a delta that skips ahead
        let _ = broadcaster.tx.send(GraphDelta {
            sequence: 3,
            op: NODE_CREATE,
            payload: json!({}),
            origin: Utc::now(),
        });
        let _ = broadcaster.tx.send(GraphDelta {
            sequence: 8,
            op: NODE_CREATE,
            payload: json!({}),
            origin: Utc::now(),
        });

        assert_eq!(unwrap_delta(sub.next().await).sequence, 1);
        match sub.next().await {
            Some(DeltaItem::Resynced(snapshot)) => assert_eq!(snapshot.sequence, 7),
            other => panic!("expected resync, got {other:?}"),
        }
        assert_eq!(sub.resync_count(), 1);
        assert_eq!(sub.last_sequence(), 7);

        assert_eq!(unwrap_delta(sub.next().await).sequence, 8);
        assert_eq!(sub.resync_count(), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_resyncs_without_blocking_publisher() {
        let broadcaster = Arc::new(DeltaBroadcaster::new(2));
        let for_resync = Arc::clone(&broadcaster);
        let resync: ResyncFn = Arc::new(move || GraphSnapshot {
            sequence: for_resync.current_sequence(),
            nodes: Vec::new(),
            edges: Vec::new(),
        });
        let mut slow = broadcaster.subscribe("slow", resync);
        let mut fast = broadcaster.subscribe("fast", fixed_snapshot(0));

        for _ in 0..5 {
            broadcaster.publish(NODE_CREATE, json!({}));
            fast.next().await;
        }
        assert_eq!(fast.last_sequence(), 5);

        match slow.next().await {
            Some(DeltaItem::Resynced(snapshot)) => assert_eq!(snapshot.sequence, 5),
            other => panic!("expected resync, got {other:?}"),
        }
        assert_eq!(slow.resync_count(), 1);

        broadcaster.publish(NODE_CREATE, json!({}));
        assert_eq!(unwrap_delta(slow.next().await).sequence, 6);
        assert_eq!(slow.resync_count(), 1);
    }

    #[tokio::test]
    async fn closed_broadcaster_ends_subscription() {
        let broadcaster = DeltaBroadcaster::new(4);
        let mut sub = broadcaster.subscribe("ui", fixed_snapshot(0));
        drop(broadcaster);
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn delta_serializes_flat() {
        let delta = GraphDelta {
            sequence: 1,
            op: DeltaOp::new(DeltaKind::Delete, DeltaTarget::Edge),
            payload: json!({ "id": "e1" }),
            origin: Utc::now(),
        };
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value["kind"], "delete");
        assert_eq!(value["target"], "edge");
        assert_eq!(value["sequence"], 1);
    }
}
