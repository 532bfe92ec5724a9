//! Ordered fan-out of orchestrator events to observers.
//!
//! Every subscriber owns an unbounded queue. [`EventEmitter::emit`] pushes the
//! event onto each queue while holding the subscriber lock, so all
//! subscribers see events in emission order. Sinks are drained by their own
//! task; a slow or failing sink only delays itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::types::{NodeId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Thinking,
    Explanation,
    NodeUpdate,
    ApprovalRequest,
    TaskCreated,
    Error,
    Completion,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Thinking => "thinking",
            EventKind::Explanation => "explanation",
            EventKind::NodeUpdate => "node_update",
            EventKind::ApprovalRequest => "approval_request",
            EventKind::TaskCreated => "task_created",
            EventKind::Error => "error",
            EventKind::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        session_id: SessionId,
        node_id: Option<NodeId>,
        content: Value,
    ) -> Self {
        Self {
            kind,
            session_id,
            node_id,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// An observer of session events.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn receive(&self, event: &Event) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    queues: Vec<(SubscriptionId, mpsc::UnboundedSender<Event>)>,
}

/// Cloneable handle to one session's subscriber registry.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<Mutex<Subscribers>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. Its deliveries run on a dedicated task, so this must
    /// be called from within a tokio runtime.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let (id, mut rx) = self.subscribe_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = sink.receive(&event).await {
                    warn!(
                        subscription = id.0,
                        event_type = event.kind.label(),
                        error = %err,
                        "event sink failed"
                    );
                }
            }
            debug!(subscription = id.0, "event sink drained");
        });
        id
    }

    /// Register an in-process observer and return its receiving end.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.lock();
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;
        subscribers.queues.push((id, tx));
        (id, rx)
    }

    /// Remove a subscriber. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.lock();
        let before = subscribers.queues.len();
        subscribers.queues.retain(|(existing, _)| *existing != id);
        subscribers.queues.len() != before
    }

    /// Deliver `event` to every current subscriber.
    pub fn emit(&self, event: Event) {
        let mut subscribers = self.inner.lock();
        subscribers.queues.retain(|(id, tx)| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(subscription = id.0, "dropping closed subscriber");
            }
            delivered
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    use crate::test_support::RecordingSink;

    fn event(n: u64) -> Event {
        Event::new(
            EventKind::Thinking,
            SessionId::from("s"),
            None,
            json!({ "n": n }),
        )
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn receive(&self, _event: &Event) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("sink offline"))
        }
    }

    struct SlowSink;

    #[async_trait]
    impl EventSink for SlowSink {
        async fn receive(&self, _event: &Event) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[test]
    fn event_serializes_with_snake_case_type() {
        let value = serde_json::to_value(Event::new(
            EventKind::ApprovalRequest,
            SessionId::from("s1"),
            Some(NodeId::from("node_1")),
            json!("x"),
        ))
        .expect("serialize");
        assert_eq!(value["type"], "approval_request");
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["node_id"], "node_1");
    }

    #[tokio::test]
    async fn channel_subscribers_receive_in_emission_order() {
        let emitter = EventEmitter::new();
        let (_, mut rx) = emitter.subscribe_channel();
        for n in 0..5 {
            emitter.emit(event(n));
        }
        for n in 0..5 {
            let received = rx.recv().await.expect("event");
            assert_eq!(received.content["n"], n);
        }
    }

    #[tokio::test]
    async fn failing_and_slow_sinks_do_not_block_others() {
        let emitter = EventEmitter::new();
        emitter.subscribe(Arc::new(FailingSink));
        emitter.subscribe(Arc::new(SlowSink));
        let recording = Arc::new(RecordingSink::default());
        emitter.subscribe(recording.clone());

        for n in 0..3 {
            emitter.emit(event(n));
        }

        let events = recording.wait_for(3).await;
        let ns: Vec<_> = events.iter().map(|e| e.content["n"].clone()).collect();
        assert_eq!(ns, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_deliveries() {
        let emitter = EventEmitter::new();
        let (id, mut rx) = emitter.subscribe_channel();
        emitter.emit(event(1));
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(event(2));

        assert_eq!(rx.recv().await.expect("queued event").content["n"], 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let emitter = EventEmitter::new();
        let (_, rx) = emitter.subscribe_channel();
        drop(rx);
        assert_eq!(emitter.subscriber_count(), 1);
        emitter.emit(event(0));
        assert_eq!(emitter.subscriber_count(), 0);
    }
}
