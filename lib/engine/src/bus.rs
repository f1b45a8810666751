//! In-process publish/subscribe for live progress events.
//!
//! Two channel forms are recognized: the wildcard `*` (every event) and
//! `flow-run:<id>` (only events for that flow run). Publish fans out
//! synchronously; each subscriber receives events through a bounded
//! buffer and slow subscribers drop newer events rather than block the
//! publisher. The bus makes no durability guarantee — timeline
//! persistence is the durable log.

use flowforge_core::{FlowRunId, NodeRunId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// The wildcard channel receiving every event.
pub const WILDCARD_CHANNEL: &str = "*";

/// Per-subscriber buffer capacity.
const SUBSCRIBER_BUFFER: usize = 100;

/// Event types emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "flow.started")]
    FlowStarted,
    #[serde(rename = "flow.completed")]
    FlowCompleted,
    #[serde(rename = "flow.failed")]
    FlowFailed,
    #[serde(rename = "flow.cancelled")]
    FlowCancelled,
    #[serde(rename = "node.queued")]
    NodeQueued,
    #[serde(rename = "node.started")]
    NodeStarted,
    #[serde(rename = "node.completed")]
    NodeCompleted,
    #[serde(rename = "node.failed")]
    NodeFailed,
    #[serde(rename = "node.rejected")]
    NodeRejected,
    #[serde(rename = "node.waiting_human")]
    NodeWaitingHuman,
    #[serde(rename = "node.log_stream")]
    NodeLogStream,
}

impl EventKind {
    /// Wire representation, e.g. `node.completed`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowStarted => "flow.started",
            Self::FlowCompleted => "flow.completed",
            Self::FlowFailed => "flow.failed",
            Self::FlowCancelled => "flow.cancelled",
            Self::NodeQueued => "node.queued",
            Self::NodeStarted => "node.started",
            Self::NodeCompleted => "node.completed",
            Self::NodeFailed => "node.failed",
            Self::NodeRejected => "node.rejected",
            Self::NodeWaitingHuman => "node.waiting_human",
            Self::NodeLogStream => "node.log_stream",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Flow run the event belongs to.
    pub flow_run_id: FlowRunId,
    /// Node run, when the event narrows to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_run_id: Option<NodeRunId>,
    /// DAG-local node id, when the event narrows to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Free-form payload.
    #[serde(default)]
    pub data: Map<String, JsonValue>,
    /// Milliseconds since epoch, filled in on publish when zero.
    #[serde(default)]
    pub timestamp: i64,
}

impl Event {
    /// Creates a flow-scoped event with no payload.
    #[must_use]
    pub fn new(kind: EventKind, flow_run_id: FlowRunId) -> Self {
        Self {
            kind,
            flow_run_id,
            node_run_id: None,
            node_id: None,
            data: Map::new(),
            timestamp: 0,
        }
    }

    /// Narrows the event to a node run.
    #[must_use]
    pub fn for_node(mut self, node_run_id: NodeRunId, node_id: impl Into<String>) -> Self {
        self.node_run_id = Some(node_run_id);
        self.node_id = Some(node_id.into());
        self
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: Map<String, JsonValue>) -> Self {
        self.data = data;
        self
    }
}

/// Returns the channel name carrying events for one flow run.
#[must_use]
pub fn flow_channel(flow_run_id: FlowRunId) -> String {
    format!("flow-run:{flow_run_id}")
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// A live subscription. Dropping the subscription (its receiver) causes
/// the bus to prune the slot on the next publish.
pub struct Subscription {
    /// Subscriber id, usable with [`EventBus::unsubscribe`].
    pub id: u64,
    /// The channel subscribed to.
    pub channel: String,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// The in-process event bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber on a channel (`*` or `flow-run:<id>`).
    pub fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .entry(channel.clone())
            .or_default()
            .push(SubscriberSlot { id, tx });

        Subscription {
            id,
            channel,
            receiver,
        }
    }

    /// Removes one subscriber from a channel.
    pub fn unsubscribe(&self, channel: &str, id: u64) {
        let mut table = self.subscribers.lock().expect("subscriber table poisoned");
        if let Some(slots) = table.get_mut(channel) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                table.remove(channel);
            }
        }
    }

    /// Publishes an event to all matching subscribers.
    ///
    /// Fills in the timestamp when unset. Full buffers drop the event
    /// for that subscriber; closed receivers are pruned.
    pub fn publish(&self, mut event: Event) {
        if event.timestamp == 0 {
            event.timestamp = chrono::Utc::now().timestamp_millis();
        }

        debug!(
            kind = %event.kind,
            flow_run_id = %event.flow_run_id,
            "publishing event"
        );

        let flow_channel = flow_channel(event.flow_run_id);
        let mut table = self.subscribers.lock().expect("subscriber table poisoned");

        for channel in [WILDCARD_CHANNEL, flow_channel.as_str()] {
            let Some(slots) = table.get_mut(channel) else {
                continue;
            };
            slots.retain(|slot| match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(channel, subscriber = slot.id, "subscriber full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if slots.is_empty() {
                table.remove(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, flow: FlowRunId) -> Event {
        Event::new(kind, flow)
    }

    #[tokio::test]
    async fn wildcard_receives_every_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(WILDCARD_CHANNEL);

        let flow_a = FlowRunId::new();
        let flow_b = FlowRunId::new();
        bus.publish(event(EventKind::FlowStarted, flow_a));
        bus.publish(event(EventKind::FlowCompleted, flow_b));

        assert_eq!(sub.recv().await.unwrap().flow_run_id, flow_a);
        assert_eq!(sub.recv().await.unwrap().flow_run_id, flow_b);
    }

    #[tokio::test]
    async fn flow_channel_filters_by_flow() {
        let bus = EventBus::new();
        let flow_a = FlowRunId::new();
        let flow_b = FlowRunId::new();
        let mut sub = bus.subscribe(flow_channel(flow_a));

        bus.publish(event(EventKind::FlowStarted, flow_b));
        bus.publish(event(EventKind::FlowStarted, flow_a));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.flow_run_id, flow_a);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn timestamp_filled_on_publish() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(WILDCARD_CHANNEL);

        bus.publish(event(EventKind::NodeQueued, FlowRunId::new()));

        assert!(sub.recv().await.unwrap().timestamp > 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_newer_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(WILDCARD_CHANNEL);
        let flow = FlowRunId::new();

        // Fill past the buffer without draining.
        for i in 0..150 {
            let mut e = event(EventKind::NodeLogStream, flow);
            e.data.insert("seq".to_string(), json!(i));
            bus.publish(e);
        }

        let mut received = Vec::new();
        while let Some(e) = sub.try_recv() {
            received.push(e.data["seq"].as_i64().unwrap());
        }

        // The first 100 made it; the overflow was dropped, publisher
        // never blocked.
        assert_eq!(received.len(), 100);
        assert_eq!(received[0], 0);
        assert_eq!(*received.last().unwrap(), 99);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let flow = FlowRunId::new();
        let sub = bus.subscribe(flow_channel(flow));
        drop(sub);

        bus.publish(event(EventKind::FlowStarted, flow));

        let table = bus.subscribers.lock().unwrap();
        assert!(table.get(&flow_channel(flow)).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_slot() {
        let bus = EventBus::new();
        let sub = bus.subscribe(WILDCARD_CHANNEL);
        bus.unsubscribe(WILDCARD_CHANNEL, sub.id);

        bus.publish(event(EventKind::FlowStarted, FlowRunId::new()));

        let table = bus.subscribers.lock().unwrap();
        assert!(table.get(WILDCARD_CHANNEL).is_none());
    }

    #[test]
    fn event_serializes_with_wire_type() {
        let e = Event::new(EventKind::NodeWaitingHuman, FlowRunId::new());
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "node.waiting_human");
    }
}
