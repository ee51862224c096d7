use crate::connection::RabbitMQError;
use crate::events::{EventMessage, EventStatus};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Persistence port for event envelopes, keyed by `message_id`. The core
/// never implements this; it is shared by reference between the consumer and
/// the publisher, and all serialization is the store's responsibility.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists the event; fails if the `message_id` is already present.
    async fn save_event(&self, event: &EventMessage) -> Result<(), StoreError>;

    async fn update_event_status(
        &self,
        event: &EventMessage,
        status: EventStatus,
    ) -> Result<(), StoreError>;

    /// Looks up the stored event with the same `message_id`.
    async fn get_event(&self, event: &EventMessage) -> Result<Option<EventMessage>, StoreError>;

    async fn delete_event(&self, event: &EventMessage) -> Result<(), StoreError>;
}

/// Stores that can list events by status. The deferred publisher requires
/// this capability at construction; the instant publisher gets by with
/// [`EventStore`] alone.
#[async_trait]
pub trait PendingEventStore: EventStore {
    async fn get_pending_events(
        &self,
        status: EventStatus,
    ) -> Result<Vec<EventMessage>, StoreError>;
}

/// Confirms the store is reachable with a synthetic lookup against a
/// sentinel identity, retried with a fixed delay.
pub(crate) async fn probe_store(
    store: &dyn EventStore,
    retries: u32,
    delay: Duration,
) -> Result<(), RabbitMQError> {
    let sentinel = EventMessage::new(
        format!("store-probe-{}", Uuid::now_v7()),
        "store.probe",
        Value::Null,
    );

    let attempts = retries.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match store.get_event(&sentinel).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                last_error = e.to_string();
                warn!("Event store probe failed (attempt {attempt}/{attempts}): {last_error}");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(RabbitMQError::StoreUnavailable(last_error))
}
