use crate::config::{ConsumerConfig, DeadLetterQueueConfig, DEFAULT_MAX_ATTEMPTS};
use crate::connection::MessageQueue;
use crate::dead_letter;
use crate::events::{death_count, EventMessage, EventStatus, Header};
use crate::hooks::{HookDecision, LifecycleHooks};
use crate::middleware::{EventHandlerEntry, HandlerError, HandlerFuture, Middleware, Next};
use crate::store::EventStore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-delivery state machine. Returning `Ok` acks the delivery upstream;
/// returning `Err` nacks it without requeue so the broker dead-letters it
/// into the retry queue (or the DLQ) per the declared topology.
pub(crate) struct ConsumeProcessor {
    port: Arc<MessageQueue>,
    store: Option<Arc<dyn EventStore>>,
    handlers: Vec<EventHandlerEntry>,
    middleware: Vec<Arc<dyn Middleware>>,
    hooks: LifecycleHooks,
    max_attempts: u32,
    dead_letter_queue: Option<DeadLetterQueueConfig>,
    main_queue: String,
    ignore_unknown_events: bool,
}

impl ConsumeProcessor {
    pub(crate) fn new(config: &ConsumerConfig, port: Arc<MessageQueue>) -> Self {
        Self {
            port,
            store: config.store.clone(),
            handlers: config.handlers.clone(),
            middleware: config.middleware.clone(),
            hooks: config.hooks.clone(),
            max_attempts: config
                .retry_queue
                .as_ref()
                .map(|retry| retry.max_attempts)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            dead_letter_queue: config.dead_letter_queue.clone(),
            main_queue: config.queue.name.clone(),
            ignore_unknown_events: config.ignore_unknown_events,
        }
    }

    pub(crate) async fn process(&self, event: EventMessage) -> Result<(), HandlerError> {
        let attempts = death_count(&event.properties);

        if let Some(on_event_start) = &self.hooks.on_event_start {
            if on_event_start(&event) == HookDecision::Skip {
                debug!("Event {} skipped by on_event_start", event.message_id);
                return Ok(());
            }
        }

        if let Some(store) = &self.store {
            match store.get_event(&event).await? {
                // a row already inside the consume lifecycle on a first
                // attempt is a duplicate; a PENDING/PUBLISHED row is the
                // publisher's record of this very event and consumes normally
                Some(existing)
                    if attempts == 0
                        && existing.status.is_none_or(EventStatus::is_consume_side) =>
                {
                    info!(
                        "Duplicate event {} on first attempt, dropped without dispatch",
                        event.message_id
                    );
                    return Ok(());
                }
                Some(_) => {
                    store
                        .update_event_status(&event, EventStatus::Received)
                        .await?;
                }
                None => {
                    store
                        .save_event(&event.with_status(EventStatus::Received))
                        .await?;
                }
            }
        }

        let Some(entry) = self
            .handlers
            .iter()
            .find(|entry| entry.event_type == event.event_type)
        else {
            return self.handle_unknown(&event).await;
        };
        let entry = entry.clone();

        match self.dispatch(&event, &entry).await {
            Ok(()) => Ok(()),
            Err(error) => self.handle_failure(&event, error, attempts).await,
        }
    }

    /// Runs the middleware chain; the terminal action marks PROCESSING,
    /// invokes the handler and marks DONE on success.
    async fn dispatch(
        &self,
        event: &EventMessage,
        entry: &EventHandlerEntry,
    ) -> Result<(), HandlerError> {
        let store = self.store.clone();
        let hooks = self.hooks.clone();
        let handler = entry.handler.clone();

        let endpoint = move |event: &EventMessage| -> HandlerFuture {
            let store = store.clone();
            let hooks = hooks.clone();
            let handler = handler.clone();
            let event = event.clone();
            Box::pin(async move {
                if let Some(store) = &store {
                    store
                        .update_event_status(&event, EventStatus::Processing)
                        .await?;
                }
                handler(event.clone()).await?;
                if let Some(store) = &store {
                    store.update_event_status(&event, EventStatus::Done).await?;
                }
                if let Some(on_success) = &hooks.on_success {
                    on_success(&event);
                }
                Ok(())
            })
        };

        Next::new(&self.middleware, &endpoint).run(event).await
    }

    async fn handle_unknown(&self, event: &EventMessage) -> Result<(), HandlerError> {
        if self.ignore_unknown_events {
            warn!(
                "No handler for event type {:?}, deleting event {}",
                event.event_type, event.message_id
            );
            if let Some(store) = &self.store {
                store.delete_event(event).await?;
            }
        } else {
            warn!(
                "No handler for event type {:?}, draining event {}",
                event.event_type, event.message_id
            );
            if let Some(store) = &self.store {
                store.update_event_status(event, EventStatus::Done).await?;
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        event: &EventMessage,
        error: HandlerError,
        attempts: u64,
    ) -> Result<(), HandlerError> {
        let current_attempt = attempts + 1;
        let max_attempts = u64::from(self.max_attempts);

        if current_attempt < max_attempts {
            if let Some(store) = &self.store {
                if let Err(e) = store.update_event_status(event, EventStatus::Retry).await {
                    warn!("Failed to mark event {} for retry: {e}", event.message_id);
                }
            }
            if let Some(on_error) = &self.hooks.on_error {
                on_error(event, &error);
            }
            debug!(
                "Attempt {current_attempt}/{max_attempts} failed for event {}, routing to retry",
                event.message_id
            );
            return Err(error);
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.update_event_status(event, EventStatus::Error).await {
                warn!("Failed to mark event {} as errored: {e}", event.message_id);
            }
        }
        if let Some(on_error) = &self.hooks.on_error {
            on_error(event, &error);
        }

        match &self.dead_letter_queue {
            Some(config) => {
                let mut copy = event.clone();
                copy.properties
                    .headers
                    .insert(Header::ORIGINAL_ERROR.to_string(), json!(error.to_string()));
                copy.properties
                    .headers
                    .insert(Header::FAILED_ATTEMPTS.to_string(), json!(current_attempt));
                if let Err(e) = dead_letter::publish_to_dead_letter_queue(
                    &self.port,
                    config,
                    &copy,
                    Some(&error),
                    current_attempt,
                    &self.main_queue,
                )
                .await
                {
                    error!(
                        "Failed to dead-letter event {}: {:?}",
                        event.message_id, e
                    );
                }
            }
            None => {
                warn!(
                    "Retries exhausted for event {} and no dead letter queue is configured, dropping",
                    event.message_id
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_processor {
    use super::*;
    use crate::config::RetryQueueConfig;
    use crate::middleware::on_event;
    use crate::test::setup::{event, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: Arc<MemoryStore>,
        calls: Arc<AtomicUsize>,
        errors: Arc<AtomicUsize>,
    }

    fn processor(configure: impl FnOnce(&mut ConsumerConfig)) -> (ConsumeProcessor, Fixture) {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let mut config = ConsumerConfig::new("amqp://localhost:5672", "orders");
        config.store = Some(store.clone());
        let handler_calls = calls.clone();
        config.handlers.push(on_event("order.created", move |_event| {
            let calls = handler_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        let error_count = errors.clone();
        config.hooks.on_error = Some(Arc::new(move |_event, _error| {
            error_count.fetch_add(1, Ordering::SeqCst);
        }));
        configure(&mut config);

        let port = Arc::new(MessageQueue::new("amqp://localhost:5672"));
        (
            ConsumeProcessor::new(&config, port),
            Fixture {
                store,
                calls,
                errors,
            },
        )
    }

    fn failing_handler(calls: Arc<AtomicUsize>) -> EventHandlerEntry {
        on_event("order.created", move |_event| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), HandlerError>("boom".into())
            }
        })
    }

    fn with_attempts(mut event: EventMessage, attempts: u64) -> EventMessage {
        event.properties.headers.insert(
            Header::DEATH.to_string(),
            json!([{"count": attempts, "queue": "orders"}]),
        );
        event
    }

    #[tokio::test]
    async fn first_delivery_is_saved_and_dispatched() {
        let (processor, fixture) = processor(|_| {});

        processor.process(event("m-1", "order.created")).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.store.save_calls(), 1);
        assert_eq!(fixture.store.status_of("m-1"), Some(EventStatus::Done));
        assert_eq!(
            fixture.store.history_of("m-1"),
            vec![EventStatus::Received, EventStatus::Processing, EventStatus::Done]
        );
    }

    #[tokio::test]
    async fn duplicate_first_delivery_is_dropped_without_dispatch() {
        let (processor, fixture) = processor(|_| {});
        fixture
            .store
            .insert(event("m-1", "order.created").with_status(EventStatus::Done));

        processor.process(event("m-1", "order.created")).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.store.save_calls(), 0);
        assert_eq!(fixture.store.status_of("m-1"), Some(EventStatus::Done));
    }

    #[tokio::test]
    async fn published_row_is_consumed_rather_than_deduped() {
        let (processor, fixture) = processor(|_| {});
        // the publisher's own record of the event, not a consume duplicate
        fixture
            .store
            .insert(event("m-1", "order.created").with_status(EventStatus::Published));

        processor.process(event("m-1", "order.created")).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.store.status_of("m-1"), Some(EventStatus::Done));
        assert_eq!(
            fixture.store.history_of("m-1"),
            vec![EventStatus::Received, EventStatus::Processing, EventStatus::Done]
        );
    }

    #[tokio::test]
    async fn redelivery_of_a_known_event_is_dispatched_again() {
        let (processor, fixture) = processor(|_| {});
        fixture
            .store
            .insert(event("m-1", "order.created").with_status(EventStatus::Retry));

        let redelivery = with_attempts(event("m-1", "order.created"), 1);
        processor.process(redelivery).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        // re-delivery re-enters through RECEIVED rather than a fresh insert
        assert_eq!(fixture.store.save_calls(), 0);
        assert_eq!(fixture.store.status_of("m-1"), Some(EventStatus::Done));
    }

    #[tokio::test]
    async fn redelivery_with_a_lost_row_is_inserted_fresh() {
        let (processor, fixture) = processor(|_| {});

        let redelivery = with_attempts(event("m-1", "order.created"), 1);
        processor.process(redelivery).await.unwrap();

        assert_eq!(fixture.store.save_calls(), 1);
        assert_eq!(fixture.store.status_of("m-1"), Some(EventStatus::Done));
    }

    #[tokio::test]
    async fn unknown_event_type_is_drained_as_done() {
        let (processor, fixture) = processor(|_| {});

        processor.process(event("m-2", "order.unknown")).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.store.status_of("m-2"), Some(EventStatus::Done));
    }

    #[tokio::test]
    async fn unknown_event_type_is_deleted_when_ignored() {
        let (processor, fixture) = processor(|config| {
            config.ignore_unknown_events = true;
        });

        processor.process(event("m-2", "order.unknown")).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert!(!fixture.store.contains("m-2"));
    }

    #[tokio::test]
    async fn failure_below_the_ceiling_marks_retry_and_rethrows() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = failing_handler(calls.clone());
        let (processor, fixture) = processor(move |config| {
            config.handlers = vec![failing];
            config.retry_queue = Some(RetryQueueConfig::new("orders.retry"));
        });

        let result = processor.process(event("m-3", "order.created")).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.store.status_of("m-3"), Some(EventStatus::Retry));
        assert_eq!(fixture.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_mark_error_and_swallow() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = failing_handler(calls.clone());
        let (processor, fixture) = processor(move |config| {
            config.handlers = vec![failing];
            config.retry_queue = Some(RetryQueueConfig::new("orders.retry"));
        });

        // two prior deaths: this execution is attempt 3 of 3
        let delivery = with_attempts(event("m-3", "order.created"), 2);
        let result = processor.process(delivery).await;

        assert!(result.is_ok());
        assert_eq!(fixture.store.status_of("m-3"), Some(EventStatus::Error));
        assert_eq!(fixture.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_swallow_even_when_dead_lettering_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = failing_handler(calls.clone());
        let (processor, fixture) = processor(move |config| {
            config.handlers = vec![failing];
            config.retry_queue = Some(RetryQueueConfig::new("orders.retry"));
            // the test port is never connected, so this emission fails and is logged
            config.dead_letter_queue = Some(DeadLetterQueueConfig::queue("orders.dlq"));
        });

        let delivery = with_attempts(event("m-3", "order.created"), 2);
        let result = processor.process(delivery).await;

        assert!(result.is_ok());
        assert_eq!(fixture.store.status_of("m-3"), Some(EventStatus::Error));
    }

    #[tokio::test]
    async fn skip_decision_acks_without_dispatch_or_store_changes() {
        let (processor, fixture) = processor(|config| {
            config.hooks.on_event_start = Some(Arc::new(|_event| HookDecision::Skip));
        });

        processor.process(event("m-4", "order.created")).await.unwrap();

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.store.save_calls(), 0);
        assert_eq!(fixture.store.get_calls(), 0);
    }

    #[tokio::test]
    async fn on_success_hook_fires_after_done() {
        let successes = Arc::new(AtomicUsize::new(0));
        let success_count = successes.clone();
        let (processor, fixture) = processor(move |config| {
            config.hooks.on_success = Some(Arc::new(move |_event| {
                success_count.fetch_add(1, Ordering::SeqCst);
            }));
        });

        processor.process(event("m-5", "order.created")).await.unwrap();

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.store.status_of("m-5"), Some(EventStatus::Done));
    }

    #[tokio::test]
    async fn first_matching_handler_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_calls = first.clone();
        let second_calls = second.clone();
        let (processor, _fixture) = processor(move |config| {
            config.handlers = vec![
                on_event("order.created", move |_event| {
                    let calls = first_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                on_event("order.created", move |_event| {
                    let calls = second_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ];
        });

        processor.process(event("m-6", "order.created")).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn works_without_a_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let mut config = ConsumerConfig::new("amqp://localhost:5672", "orders");
        config.handlers.push(on_event("order.created", move |_event| {
            let calls = handler_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        let port = Arc::new(MessageQueue::new("amqp://localhost:5672"));
        let processor = ConsumeProcessor::new(&config, port);

        processor.process(event("m-7", "order.created")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
