use crate::config::DeadLetterQueueConfig;
use crate::connection::{MessageQueue, PublishOptions, RabbitMQError};
use crate::events::{EventMessage, Header};
use crate::middleware::HandlerError;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::{info, warn};

/// Renders the error and its source chain, outermost first.
fn error_stack(error: &HandlerError) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

/// Copies the event with failure context stamped into its headers. Existing
/// `x-first-death-*` annotations are left untouched.
pub(crate) fn enrich_for_dead_letter(
    event: &EventMessage,
    error: Option<&HandlerError>,
    death_count: u64,
    original_queue: &str,
) -> EventMessage {
    let mut copy = event.clone();
    let headers = &mut copy.properties.headers;

    if let Some(error) = error {
        headers.insert(Header::ERROR_MESSAGE.to_string(), json!(error.to_string()));
        headers.insert(Header::ERROR_NAME.to_string(), json!("Error"));
        headers.insert(Header::ERROR_STACK.to_string(), json!(error_stack(error)));
    }
    headers.insert(Header::DEATH_COUNT.to_string(), json!(death_count));
    headers.insert(Header::ORIGINAL_QUEUE.to_string(), json!(original_queue));
    headers.insert(
        Header::DEATH_REASON.to_string(),
        json!(if error.is_some() { "rejected" } else { "expired" }),
    );
    headers.insert(
        Header::DEATH_TIME.to_string(),
        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    copy
}

/// Enriches the event with failure metadata and emits it to the configured
/// dead letter queue through the borrowed broker port. With neither a queue
/// name nor an exchange configured this is a no-op: the message is logged and
/// discarded.
pub async fn publish_to_dead_letter_queue(
    port: &MessageQueue,
    config: &DeadLetterQueueConfig,
    event: &EventMessage,
    error: Option<&HandlerError>,
    death_count: u64,
    original_queue: &str,
) -> Result<(), RabbitMQError> {
    let queue = config.queue.as_deref().unwrap_or_default();
    if queue.is_empty() && config.exchange.is_none() {
        warn!(
            "No dead letter queue or exchange configured, discarding event {}",
            event.message_id
        );
        return Ok(());
    }

    let mut copy = enrich_for_dead_letter(event, error, death_count, original_queue);
    if config.exchange.is_some() && config.routing_key.is_some() {
        copy.routing_key = config.routing_key.clone();
    }

    let destination = if queue.is_empty() {
        config
            .exchange
            .as_ref()
            .map(|exchange| exchange.name.clone())
            .unwrap_or_default()
    } else {
        queue.to_string()
    };

    port.publish(
        &destination,
        &copy,
        &PublishOptions {
            exchange: config.exchange.clone(),
        },
    )
    .await?;
    info!("Event {} dead-lettered to {destination}", event.message_id);
    Ok(())
}
