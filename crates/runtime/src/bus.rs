//! Process-wide event bus: `publish(topic, payload)` fan-out to broadcast
//! subscribers, bridged into the trigger service for event triggers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use butler_triggers::TriggerService;

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    /// Stable event id; doubles as the trigger fire-key discriminator.
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event. Subscriber lag drops oldest events, publishing
    /// never blocks.
    pub fn publish(&self, topic: impl Into<String>, payload: Value) -> BusEvent {
        let event = BusEvent {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        };
        tracing::debug!(topic = %event.topic, event_id = %event.id, "event published");
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge bus events into the trigger service so event triggers fire.
/// Runs until the bus is dropped.
pub fn bridge_to_triggers(bus: &EventBus, triggers: Arc<TriggerService>) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let created = triggers.deliver_event(&event.topic, &event.id, &event.payload);
                    if !created.is_empty() {
                        tracing::debug!(
                            topic = %event.topic,
                            tasks = created.len(),
                            "event triggers fired"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "trigger bridge lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
