use crate::config::{ConsumeQueueConfig, ConsumerConfig, DeadLetterQueueConfig, RetryQueueConfig};
use crate::connection::{MessageCallback, MessageFuture, MessageQueue, PortState, RabbitMQError};
use crate::processor::ConsumeProcessor;
use crate::store::probe_store;
use lapin::types::{AMQPValue, FieldTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Where a queue dead-letters to: an exchange (possibly the default one,
/// named "") and a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Where retried messages return to once the retry TTL expires: the first
/// bound exchange carrying a routing key, else the first bound exchange, else
/// the default exchange straight at the main queue.
pub(crate) fn resolve_retry_return_target(queue: &ConsumeQueueConfig) -> DeadLetterTarget {
    match queue
        .exchanges
        .iter()
        .find(|exchange| exchange.routing_key.is_some())
        .or_else(|| queue.exchanges.first())
    {
        Some(exchange) => DeadLetterTarget {
            exchange: exchange.name.clone(),
            routing_key: exchange.routing_key.clone().unwrap_or_default(),
        },
        None => DeadLetterTarget {
            exchange: String::new(),
            routing_key: queue.name.clone(),
        },
    }
}

/// Where the main queue dead-letters to when a retry queue is configured:
/// through the retry exchange if present, else straight at the retry queue.
pub(crate) fn retry_entry_target(retry: &RetryQueueConfig) -> DeadLetterTarget {
    match &retry.exchange {
        Some(exchange) => DeadLetterTarget {
            exchange: exchange.name.clone(),
            routing_key: exchange
                .routing_key
                .clone()
                .unwrap_or_else(|| retry.name.clone()),
        },
        None => DeadLetterTarget {
            exchange: String::new(),
            routing_key: retry.name.clone(),
        },
    }
}

fn dead_letter_queue_target(dlq: &DeadLetterQueueConfig) -> Option<DeadLetterTarget> {
    dlq.exchange.as_ref().map(|exchange| DeadLetterTarget {
        exchange: exchange.name.clone(),
        routing_key: dlq.routing_key.clone().unwrap_or_default(),
    })
}

fn dead_letter_arguments(target: &DeadLetterTarget) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(target.exchange.as_str().into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(target.routing_key.as_str().into()),
    );
    arguments
}

pub(crate) fn retry_queue_arguments(
    retry: &RetryQueueConfig,
    return_target: &DeadLetterTarget,
) -> FieldTable {
    let mut arguments = dead_letter_arguments(return_target);
    arguments.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(retry.ttl.as_millis() as i64),
    );
    arguments
}

/// Main-queue arguments: dead-letter into the retry queue when one is
/// configured, else at the DLQ exchange when one is configured, else nothing.
pub(crate) fn main_queue_arguments(
    retry: Option<&RetryQueueConfig>,
    dlq: Option<&DeadLetterQueueConfig>,
) -> FieldTable {
    if let Some(retry) = retry {
        return dead_letter_arguments(&retry_entry_target(retry));
    }
    if let Some(target) = dlq.and_then(dead_letter_queue_target) {
        return dead_letter_arguments(&target);
    }
    FieldTable::default()
}

/// Supervises one consuming broker port: declares the topology, feeds
/// deliveries to the processor and keeps the connection alive through
/// heartbeats, scheduled rotation and reconnects.
#[derive(Clone)]
pub struct EventConsumer {
    config: Arc<ConsumerConfig>,
    port: Arc<MessageQueue>,
    reconnecting: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    monitors: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EventConsumer {
    pub fn new(config: ConsumerConfig) -> Self {
        let port = Arc::new(MessageQueue::new(config.connection.uri()));
        Self {
            config: Arc::new(config),
            port,
            reconnecting: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            monitors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deliveries currently being processed.
    pub fn processing_count(&self) -> usize {
        self.port.in_flight_count()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub fn port_state(&self) -> PortState {
        self.port.state()
    }

    /// Validates the configuration, declares the topology, probes the store
    /// and begins consumption, then arms the background monitors.
    pub async fn start(&self) -> Result<(), RabbitMQError> {
        self.config.validate()?;
        self.stopped.store(false, Ordering::SeqCst);

        self.port.connect(self.config.prefetch).await?;
        self.declare_topology().await?;

        if let Some(store) = &self.config.store {
            probe_store(
                store.as_ref(),
                self.config.store_connection_retries,
                self.config.store_connection_retry_delay,
            )
            .await?;
        }

        let processor = Arc::new(ConsumeProcessor::new(&self.config, Arc::clone(&self.port)));
        let callback: MessageCallback = Arc::new(move |event| -> MessageFuture {
            let processor = Arc::clone(&processor);
            Box::pin(async move { processor.process(event).await })
        });
        self.port.consume(&self.config.queue.name, callback).await?;

        self.spawn_monitors().await;
        info!("Consuming from queue {:?}", self.config.queue.name);
        Ok(())
    }

    async fn declare_topology(&self) -> Result<(), RabbitMQError> {
        let config = &self.config;

        if let Some(dlq) = &config.dead_letter_queue {
            if let Some(exchange) = &dlq.exchange {
                self.port.declare_exchange(exchange).await?;
            }
            if let Some(queue) = dlq.queue.as_deref().filter(|queue| !queue.is_empty()) {
                self.port
                    .declare_queue(queue, true, FieldTable::default())
                    .await?;
                if let Some(exchange) = &dlq.exchange {
                    self.port
                        .bind_queue(
                            queue,
                            &exchange.name,
                            dlq.routing_key.as_deref().unwrap_or_default(),
                        )
                        .await?;
                }
            }
        }

        if let Some(retry) = &config.retry_queue {
            let return_target = resolve_retry_return_target(&config.queue);
            if let Some(exchange) = &retry.exchange {
                self.port.declare_exchange(exchange).await?;
            }
            self.port
                .declare_queue(&retry.name, true, retry_queue_arguments(retry, &return_target))
                .await?;
            if let Some(exchange) = &retry.exchange {
                self.port
                    .bind_queue(
                        &retry.name,
                        &exchange.name,
                        exchange.routing_key.as_deref().unwrap_or(&retry.name),
                    )
                    .await?;
            }
        }

        let arguments =
            main_queue_arguments(config.retry_queue.as_ref(), config.dead_letter_queue.as_ref());
        self.port
            .declare_queue(&config.queue.name, config.queue.durable, arguments)
            .await?;
        for exchange in &config.queue.exchanges {
            self.port.declare_exchange(exchange).await?;
            self.port
                .bind_queue(
                    &config.queue.name,
                    &exchange.name,
                    exchange.routing_key.as_deref().unwrap_or_default(),
                )
                .await?;
        }
        Ok(())
    }

    async fn spawn_monitors(&self) {
        let mut monitors = self.monitors.lock().await;

        if let Some(max_uptime) = self.config.max_uptime {
            let consumer = self.clone();
            monitors.push(tokio::spawn(async move {
                tokio::time::sleep(max_uptime).await;
                if consumer.stopped.load(Ordering::SeqCst) {
                    return;
                }
                info!("Max uptime reached, rotating the broker connection");
                consumer.trigger_reconnect();
            }));
        }

        {
            let consumer = self.clone();
            let interval = self.config.heartbeat_interval;
            monitors.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // the first tick completes immediately
                loop {
                    ticker.tick().await;
                    if consumer.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    if consumer.reconnecting.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = consumer.port.check_queue(&consumer.config.queue.name).await {
                        warn!("Heartbeat failed: {:?}", e);
                        consumer.trigger_reconnect();
                    }
                }
            }));
        }

        if self.config.exit_if_idle {
            let consumer = self.clone();
            monitors.push(tokio::spawn(async move { consumer.idle_monitor().await }));
        }
    }

    async fn idle_monitor(&self) {
        let mut strikes = 0u32;
        let mut ticker = tokio::time::interval(self.config.idle_check_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.reconnecting.load(Ordering::SeqCst) {
                continue;
            }
            match self.queued_and_in_progress().await {
                Ok(0) => {
                    strikes += 1;
                    debug!("Idle check {strikes}/{}", self.config.max_idle_checks);
                    if strikes >= self.config.max_idle_checks {
                        info!("Idle for {strikes} consecutive checks, stopping");
                        let consumer = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = consumer.stop().await {
                                error!("Idle stop failed: {:?}", e);
                            }
                        });
                        break;
                    }
                }
                Ok(_) => strikes = 0,
                Err(e) => warn!("Idle check failed: {:?}", e),
            }
        }
    }

    async fn queued_and_in_progress(&self) -> Result<u64, RabbitMQError> {
        let mut total = self.port.in_flight_count() as u64;
        total += u64::from(self.port.check_queue(&self.config.queue.name).await?);
        if let Some(retry) = &self.config.retry_queue {
            total += u64::from(self.port.check_queue(&retry.name).await?);
        }
        Ok(total)
    }

    /// Fires a reconnect on its own task so the triggering monitor can be
    /// torn down along with the others.
    fn trigger_reconnect(&self) {
        let consumer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer.reconnect().await {
                error!("Reconnection failed: {:?}", e);
                consumer.reconnecting.store(false, Ordering::SeqCst);
            }
        });
    }

    /// Single-flight: a second trigger while one reconnect is in progress is
    /// a no-op. Cleanup failures are logged, the reconnect proceeds.
    pub async fn reconnect(&self) -> Result<(), RabbitMQError> {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnection already in progress");
            return Ok(());
        }
        warn!("Reconnecting to RabbitMQ");

        self.drain_in_progress().await;
        self.stop_monitors().await;
        self.port.disconnect().await;

        tokio::time::sleep(self.config.reconnect_delay).await;
        self.reconnecting.store(false, Ordering::SeqCst);
        self.start().await
    }

    /// Returns once in-progress deliveries hit zero and the broker port
    /// reports closed.
    pub async fn stop(&self) -> Result<(), RabbitMQError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.drain_in_progress().await;
        self.stop_monitors().await;
        self.port.cancel_all_consumers().await;
        self.port.disconnect().await;
        info!("Consumer stopped");
        Ok(())
    }

    async fn drain_in_progress(&self) {
        while self.port.in_flight_count() > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    async fn stop_monitors(&self) {
        let mut monitors = self.monitors.lock().await;
        for monitor in monitors.drain(..) {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod test_consumer {
    use super::*;
    use crate::config::ExchangeConfig;
    use crate::middleware::on_event;

    fn long_string(arguments: &FieldTable, key: &str) -> Option<String> {
        arguments.inner().get(key).and_then(|value| {
            if let AMQPValue::LongString(s) = value {
                Some(s.to_string())
            } else {
                None
            }
        })
    }

    #[test]
    fn retry_return_target_prefers_a_keyed_exchange() {
        let mut queue = ConsumeQueueConfig::new("orders");
        queue.exchanges = vec![
            ExchangeConfig::direct("orders-a"),
            ExchangeConfig::direct("orders-b").with_routing_key("order.created"),
        ];
        assert_eq!(
            resolve_retry_return_target(&queue),
            DeadLetterTarget {
                exchange: "orders-b".to_string(),
                routing_key: "order.created".to_string(),
            }
        );
    }

    #[test]
    fn retry_return_target_falls_back_to_the_first_exchange() {
        let mut queue = ConsumeQueueConfig::new("orders");
        queue.exchanges = vec![ExchangeConfig::direct("orders-a")];
        assert_eq!(
            resolve_retry_return_target(&queue),
            DeadLetterTarget {
                exchange: "orders-a".to_string(),
                routing_key: String::new(),
            }
        );
    }

    #[test]
    fn retry_return_target_defaults_to_the_main_queue() {
        let queue = ConsumeQueueConfig::new("orders");
        assert_eq!(
            resolve_retry_return_target(&queue),
            DeadLetterTarget {
                exchange: String::new(),
                routing_key: "orders".to_string(),
            }
        );
    }

    #[test]
    fn retry_queue_arguments_carry_ttl_and_return_dlx() {
        let retry = RetryQueueConfig::new("orders.retry");
        let return_target = DeadLetterTarget {
            exchange: String::new(),
            routing_key: "orders".to_string(),
        };
        let arguments = retry_queue_arguments(&retry, &return_target);

        assert_eq!(
            arguments.inner().get("x-message-ttl"),
            Some(&AMQPValue::LongLongInt(5000))
        );
        assert_eq!(
            long_string(&arguments, "x-dead-letter-exchange"),
            Some(String::new())
        );
        assert_eq!(
            long_string(&arguments, "x-dead-letter-routing-key"),
            Some("orders".to_string())
        );
    }

    #[test]
    fn main_queue_dead_letters_into_the_retry_queue_when_configured() {
        let retry = RetryQueueConfig::new("orders.retry");
        let arguments = main_queue_arguments(Some(&retry), None);
        assert_eq!(
            long_string(&arguments, "x-dead-letter-exchange"),
            Some(String::new())
        );
        assert_eq!(
            long_string(&arguments, "x-dead-letter-routing-key"),
            Some("orders.retry".to_string())
        );
    }

    #[test]
    fn main_queue_dead_letters_through_the_retry_exchange_when_present() {
        let mut retry = RetryQueueConfig::new("orders.retry");
        retry.exchange = Some(ExchangeConfig::direct("retry-exchange").with_routing_key("retry"));
        let arguments = main_queue_arguments(Some(&retry), None);
        assert_eq!(
            long_string(&arguments, "x-dead-letter-exchange"),
            Some("retry-exchange".to_string())
        );
        assert_eq!(
            long_string(&arguments, "x-dead-letter-routing-key"),
            Some("retry".to_string())
        );
    }

    #[test]
    fn main_queue_dead_letters_at_the_dlq_exchange_without_a_retry_queue() {
        let dlq = DeadLetterQueueConfig {
            queue: Some("orders.dlq".to_string()),
            exchange: Some(ExchangeConfig::direct("dlq-exchange")),
            routing_key: Some("dead".to_string()),
        };
        let arguments = main_queue_arguments(None, Some(&dlq));
        assert_eq!(
            long_string(&arguments, "x-dead-letter-exchange"),
            Some("dlq-exchange".to_string())
        );
        assert_eq!(
            long_string(&arguments, "x-dead-letter-routing-key"),
            Some("dead".to_string())
        );
    }

    #[test]
    fn main_queue_has_no_dlx_without_retry_or_dlq_exchange() {
        assert!(main_queue_arguments(None, None).inner().is_empty());

        // a queue-only DLQ relies on the explicit emission path, not a DLX
        let dlq = DeadLetterQueueConfig::queue("orders.dlq");
        assert!(main_queue_arguments(None, Some(&dlq)).inner().is_empty());
    }

    #[tokio::test]
    async fn start_rejects_an_invalid_configuration() {
        let config = ConsumerConfig::new("amqp://localhost:5672", "orders");
        let consumer = EventConsumer::new(config);
        assert!(matches!(
            consumer.start().await,
            Err(RabbitMQError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn stop_closes_the_port_and_reports_zero_in_progress() {
        let mut config = ConsumerConfig::new("amqp://localhost:5672", "orders");
        config
            .handlers
            .push(on_event("order.created", |_event| async { Ok(()) }));
        let consumer = EventConsumer::new(config);

        consumer.stop().await.unwrap();

        assert_eq!(consumer.processing_count(), 0);
        assert_eq!(consumer.port_state(), PortState::Closed);

        // stop tolerates an already-closed port
        consumer.stop().await.unwrap();
        assert_eq!(consumer.port_state(), PortState::Closed);
    }
}
