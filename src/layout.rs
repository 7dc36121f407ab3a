//! Transient spatial state across view-mode switches.
//!
//! [`LayoutStore`] remembers the user's node positions when the graph leaves the
//! default view so they can be put back when it returns. It is a plain state
//! machine; the coordinator owns one instance and hands out a shared handle.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Graph view modes, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Default,
    Clustered,
    Radial,
}

impl ViewMode {
    pub fn next(self) -> Self {
        match self {
            Self::Default => Self::Clustered,
            Self::Clustered => Self::Radial,
            Self::Radial => Self::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Clustered => "clustered",
            Self::Radial => "radial",
        }
    }
}

impl std::fmt::Display for ViewMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ViewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "clustered" => Ok(Self::Clustered),
            "radial" => Ok(Self::Radial),
            _ => Err(format!("unknown view mode: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Saved node positions, keyed by node id.
pub type LayoutSnapshot = HashMap<String, Position>;

/// Anything positions can be restored onto.
pub trait PositionTarget {
    fn contains(&self, node_id: &str) -> bool;
    fn set_position(&mut self, node_id: &str, position: Position);
}

impl PositionTarget for HashMap<String, Position> {
    fn contains(&self, node_id: &str) -> bool {
        self.contains_key(node_id)
    }

    fn set_position(&mut self, node_id: &str, position: Position) {
        if let Some(slot) = self.get_mut(node_id) {
            *slot = position;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RestoreReport {
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ModeObserver = Box<dyn FnMut(ViewMode) + Send>;

pub struct LayoutStore {
    mode: ViewMode,
    saved: Option<LayoutSnapshot>,
    observers: Vec<(ObserverId, ModeObserver)>,
    next_observer: u64,
}

/// Shared handle the coordinator passes to consumers.
pub type SharedLayout = Arc<Mutex<LayoutStore>>;

impl Default for LayoutStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutStore {
    pub fn new() -> Self {
        Self {
            mode: ViewMode::Default,
            saved: None,
            observers: Vec::new(),
            next_observer: 1,
        }
    }

    pub fn shared() -> SharedLayout {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn has_snapshot(&self) -> bool {
        self.saved.is_some()
    }

    pub fn snapshot(&self) -> Option<&LayoutSnapshot> {
        self.saved.as_ref()
    }

    /// Capture positions unless a snapshot is already held. Returns whether it was taken.
    pub fn save(&mut self, positions: LayoutSnapshot) -> bool {
        if self.saved.is_some() {
            tracing::debug!("layout snapshot already held, keeping the original");
            return false;
        }
        tracing::debug!(nodes = positions.len(), "layout snapshot saved");
        self.saved = Some(positions);
        true
    }

    /// Apply the saved positions to nodes still present in `target`, then drop the snapshot.
    pub fn restore<T: PositionTarget + ?Sized>(&mut self, target: &mut T) -> RestoreReport {
        let mut report = RestoreReport::default();
        let Some(saved) = self.saved.take() else {
            return report;
        };
        for (node_id, position) in saved {
            if target.contains(&node_id) {
                target.set_position(&node_id, position);
                report.applied += 1;
            } else {
                report.skipped += 1;
            }
        }
        tracing::debug!(
            applied = report.applied,
            skipped = report.skipped,
            "layout snapshot restored"
        );
        report
    }

    /// Advance to the next mode in cycle order and return it.
    pub fn cycle(&mut self) -> ViewMode {
        let next = self.mode.next();
        self.set_mode(next);
        next
    }

    /// Switch modes. Returns `false` (and notifies nobody) if `mode` is already current.
    pub fn set_mode(&mut self, mode: ViewMode) -> bool {
        if mode == self.mode {
            return false;
        }
        self.mode = mode;
        for (_, observer) in self.observers.iter_mut() {
            observer(mode);
        }
        true
    }

    pub fn subscribe(&mut self, observer: impl FnMut(ViewMode) + Send + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Unknown or already-removed ids are ignored.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    /// Back to the default mode with no snapshot. Observers stay registered and
    /// hear about the mode change if there is one.
    pub fn reset(&mut self) {
        self.saved = None;
        self.set_mode(ViewMode::Default);
    }
}
