//! Delivery to the presentation layer.
//!
//! The presentation target (a UI window, or whatever renders state) may come and
//! go. [`PresentationBridge`] holds it as a replaceable capability: calls made
//! while no target is attached are queued and replayed in order on the next
//! [`attach`](PresentationBridge::attach). A full queue is reported to the
//! caller, and every refused call is counted per channel. The counts reach the
//! presentation layer as a single [`OVERFLOW_CHANNEL`] call as soon as it can
//! take one again, ordered after everything that was queued before the
//! overflow.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;

/// Channel of the call reporting how many calls were refused, per channel.
pub const OVERFLOW_CHANNEL: &str = "presentation-overflow";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("presentation queue full ({capacity} calls pending)")]
    QueueFull { capacity: usize },
}

/// One message for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentationCall {
    pub channel: String,
    pub payload: serde_json::Value,
}

impl PresentationCall {
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// Returned by a target that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetGone;

pub trait PresentationTarget: Send + Sync {
    /// Deliver synchronously. Called with the bridge locked, so implementations
    /// must not call back into the bridge.
    fn deliver(&self, call: &PresentationCall) -> Result<(), TargetGone>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Queued { pending: usize },
}

/// Bridge counters, as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub attached: bool,
    pub pending: usize,
    pub capacity: usize,
    /// Calls refused since the bridge was created.
    pub refused: u64,
}

struct BridgeState {
    target: Option<Arc<dyn PresentationTarget>>,
    queue: VecDeque<PresentationCall>,
    /// Refused since the last overflow report went out.
    unreported: BTreeMap<String, u64>,
    refused_total: u64,
}

impl BridgeState {
    fn refuse(&mut self, channel: &str) {
        *self.unreported.entry(channel.to_string()).or_default() += 1;
        self.refused_total += 1;
    }

    fn take_overflow_report(&mut self) -> Option<PresentationCall> {
        if self.unreported.is_empty() {
            return None;
        }
        let channels = std::mem::take(&mut self.unreported);
        let dropped: u64 = channels.values().sum();
        Some(PresentationCall::new(
            OVERFLOW_CHANNEL,
            json!({ "dropped": dropped, "channels": channels }),
        ))
    }

    /// Deliver a pending overflow report, then `call`. An undelivered report
    /// stays at the head of the queue.
    fn deliver_after_report(
        &mut self,
        target: &dyn PresentationTarget,
        call: &PresentationCall,
    ) -> Result<(), TargetGone> {
        if let Some(report) = self.take_overflow_report() {
            if let Err(gone) = target.deliver(&report) {
                self.queue.push_back(report);
                return Err(gone);
            }
        }
        target.deliver(call)
    }
}

pub struct PresentationBridge {
    state: Mutex<BridgeState>,
    capacity: usize,
    attachments: watch::Sender<u64>,
}

impl PresentationBridge {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BridgeState {
                target: None,
                queue: VecDeque::new(),
                unreported: BTreeMap::new(),
                refused_total: 0,
            }),
            capacity: capacity.max(1),
            attachments: watch::Sender::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dispatch(&self, call: PresentationCall) -> Result<Delivery, BridgeError> {
        let mut state = self.lock();

        if let Some(target) = state.target.clone() {
            if state.queue.is_empty() {
                match state.deliver_after_report(target.as_ref(), &call) {
                    Ok(()) => return Ok(Delivery::Delivered),
                    Err(TargetGone) => {
                        tracing::warn!(channel = %call.channel, "presentation target gone, queueing");
                        state.target = None;
                    }
                }
            }
        }

        if state.queue.len() < self.capacity {
            if let Some(report) = state.take_overflow_report() {
                state.queue.push_back(report);
            }
        }
        if state.queue.len() >= self.capacity {
            state.refuse(&call.channel);
            tracing::error!(
                channel = %call.channel,
                capacity = self.capacity,
                refused = state.refused_total,
                "presentation queue full, call refused"
            );
            return Err(BridgeError::QueueFull {
                capacity: self.capacity,
            });
        }
        state.queue.push_back(call);
        Ok(Delivery::Queued {
            pending: state.queue.len(),
        })
    }

    /// Install a target and replay the queue into it, followed by the overflow
    /// report if calls were refused. Returns how many queued calls were
    /// delivered.
    pub fn attach(&self, target: Arc<dyn PresentationTarget>) -> usize {
        let mut state = self.lock();
        state.target = Some(Arc::clone(&target));

        let mut replayed = 0;
        while let Some(call) = state.queue.pop_front() {
            if target.deliver(&call).is_err() {
                tracing::warn!(replayed, "presentation target gone during replay");
                state.queue.push_front(call);
                state.target = None;
                break;
            }
            replayed += 1;
        }
        if state.target.is_some() {
            if let Some(report) = state.take_overflow_report() {
                if target.deliver(&report).is_err() {
                    tracing::warn!("presentation target gone before the overflow report");
                    state.queue.push_back(report);
                    state.target = None;
                }
            }
        }
        if replayed > 0 {
            tracing::info!(replayed, "replayed queued presentation calls");
        }
        let attached = state.target.is_some();
        drop(state);

        if attached {
            self.attachments.send_modify(|n| *n += 1);
        }
        replayed
    }

    pub fn detach(&self) {
        if self.lock().target.take().is_some() {
            tracing::info!("presentation target detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().target.is_some()
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether a dispatch made now would be accepted.
    pub fn has_room(&self) -> bool {
        let state = self.lock();
        (state.target.is_some() && state.queue.is_empty()) || state.queue.len() < self.capacity
    }

    /// Bumped after every attach that left a target installed.
    pub fn attachments(&self) -> watch::Receiver<u64> {
        self.attachments.subscribe()
    }

    pub fn stats(&self) -> BridgeStats {
        let state = self.lock();
        BridgeStats {
            attached: state.target.is_some(),
            pending: state.queue.len(),
            capacity: self.capacity,
            refused: state.refused_total,
        }
    }
}

/// Headless target: every call becomes a log line.
pub struct LogTarget;

impl PresentationTarget for LogTarget {
    fn deliver(&self, call: &PresentationCall) -> Result<(), TargetGone> {
        tracing::debug!(channel = %call.channel, payload = %call.payload, "presentation call");
        Ok(())
    }
}
