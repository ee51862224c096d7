use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle tag of an event. The publish side moves through
/// `Pending -> (Published | Error)`, the consume side through
/// `Received -> Processing -> (Done | Retry | Error)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Published,
    Received,
    Processing,
    Done,
    Retry,
    Error,
}

impl EventStatus {
    /// True for tags of the consume lifecycle. PENDING and PUBLISHED are
    /// publish-side: a stored row carrying one of them was persisted by the
    /// publisher and has not entered the consume pipeline yet.
    pub(crate) fn is_consume_side(self) -> bool {
        !matches!(self, EventStatus::Pending | EventStatus::Published)
    }
}

/// Transport metadata carried alongside the payload.
///
/// `timestamp` is unix milliseconds; `headers` hold application headers plus
/// whatever the broker stamped on the message (`x-death` and friends).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    pub timestamp: Option<u64>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
}

/// The unit of transport. `message_id` is the identity under which the store
/// deduplicates; it must be stable across retries of the same logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub message_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub status: Option<EventStatus>,
    #[serde(default)]
    pub properties: MessageProperties,
}

impl EventMessage {
    pub fn new(message_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            event_type: event_type.into(),
            payload,
            routing_key: None,
            status: None,
            properties: MessageProperties::default(),
        }
    }

    /// Same event with its lifecycle tag replaced.
    pub(crate) fn with_status(&self, status: EventStatus) -> Self {
        let mut event = self.clone();
        event.status = Some(status);
        event
    }
}

/// Header names used on the wire.
pub struct Header;

impl Header {
    /// Mirror of the AMQP message-id property, kept for hops that drop properties.
    pub const MESSAGE_ID: &'static str = "x-message-id";
    /// Mirror of the AMQP type property.
    pub const EVENT_TYPE: &'static str = "x-event-type";
    /// Broker-maintained death annotation; `x-death[0].count` is the attempt count.
    pub const DEATH: &'static str = "x-death";
    /// Message of the error that exhausted the retries.
    pub const ORIGINAL_ERROR: &'static str = "x-original-error";
    /// Number of handler attempts consumed before dead-lettering.
    pub const FAILED_ATTEMPTS: &'static str = "x-failed-attempts";
    pub const ERROR_MESSAGE: &'static str = "x-error-message";
    pub const ERROR_NAME: &'static str = "x-error-name";
    pub const ERROR_STACK: &'static str = "x-error-stack";
    pub const DEATH_COUNT: &'static str = "x-death-count";
    pub const ORIGINAL_QUEUE: &'static str = "x-original-queue";
    /// `rejected` when an error is attached, `expired` otherwise.
    pub const DEATH_REASON: &'static str = "x-death-reason";
    /// ISO-8601 instant of the dead-letter emission.
    pub const DEATH_TIME: &'static str = "x-death-time";
}

/// How many times this logical message has already been dead-lettered from
/// the main queue, read from `x-death[0].count`. Zero when the annotation is
/// absent, i.e. a first delivery.
pub(crate) fn death_count(properties: &MessageProperties) -> u64 {
    properties
        .headers
        .get(Header::DEATH)
        .and_then(Value::as_array)
        .and_then(|deaths| deaths.first())
        .and_then(|death| death.get("count"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test_events {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(EventStatus::Pending.as_ref(), "PENDING");
        assert_eq!(EventStatus::Done.to_string(), "DONE");
        assert_eq!(EventStatus::from_str("RETRY").unwrap(), EventStatus::Retry);
        assert!(EventStatus::from_str("NOPE").is_err());
    }

    #[test]
    fn event_serializes_with_wire_field_names() {
        let event = EventMessage::new("m-1", "order.created", json!({"id": 42}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["messageId"], "m-1");
        assert_eq!(value["type"], "order.created");
        assert_eq!(value["payload"]["id"], 42);
    }

    #[test]
    fn death_count_reads_the_first_entry() {
        let mut event = EventMessage::new("m-1", "t", json!({}));
        assert_eq!(death_count(&event.properties), 0);

        event.properties.headers.insert(
            Header::DEATH.to_string(),
            json!([{"count": 2, "queue": "orders"}, {"count": 7}]),
        );
        assert_eq!(death_count(&event.properties), 2);
    }

    #[test]
    fn death_count_tolerates_malformed_annotations() {
        let mut event = EventMessage::new("m-1", "t", json!({}));
        event
            .properties
            .headers
            .insert(Header::DEATH.to_string(), json!("not-an-array"));
        assert_eq!(death_count(&event.properties), 0);

        event
            .properties
            .headers
            .insert(Header::DEATH.to_string(), json!([{"queue": "orders"}]));
        assert_eq!(death_count(&event.properties), 0);
    }
}
