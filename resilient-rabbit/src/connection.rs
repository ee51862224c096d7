use crate::config::ExchangeConfig;
use crate::events::{EventMessage, Header, MessageProperties};
use crate::middleware::HandlerError;
use backoff::{Error as BackoffError, ExponentialBackoff};
use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RabbitMQError {
    #[error("Connection error: {0}")]
    Connection(#[from] lapin::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Broker connection is not open")]
    NotConnected,
    #[error("Backoff error: {0}")]
    Backoff(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Event store error: {0}")]
    Store(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Lifecycle of a broker port: `New` before the first `connect`, `Open` while
/// a channel is usable, `Closed` after transport loss or `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    New,
    Open,
    Closed,
}

/// Options for a single publish. When `exchange` is set the event is routed
/// through it with the event's routing key; otherwise it goes straight to the
/// destination queue via the default exchange.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub exchange: Option<ExchangeConfig>,
}

pub type MessageFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
pub type MessageCallback = Arc<dyn Fn(EventMessage) -> MessageFuture + Send + Sync>;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Thin semantic adapter over one AMQP connection and channel.
///
/// A port has exactly one owner (a consumer supervisor or a publisher); the
/// consume processor only borrows it to emit dead-letter copies. Concurrent
/// publishes serialize on the channel handle.
pub struct MessageQueue {
    uri: String,
    connection: Mutex<Option<Connection>>,
    channel: Mutex<Option<Channel>>,
    consumer_tags: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    state: StdRwLock<PortState>,
}

impl MessageQueue {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection: Mutex::new(None),
            channel: Mutex::new(None),
            consumer_tags: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            state: StdRwLock::new(PortState::New),
        }
    }

    pub fn state(&self) -> PortState {
        *self.state.read().unwrap()
    }

    /// Deliveries currently inside a handler. `disconnect` drains this to
    /// zero before tearing the channel down.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        match self.channel.lock().await.as_ref() {
            Some(channel) => channel.status().connected(),
            None => false,
        }
    }

    /// Establishes the connection and channel and applies the prefetch.
    /// Reconnecting a closed port re-opens it.
    pub async fn connect(&self, prefetch: u16) -> Result<(), RabbitMQError> {
        let mut connection_guard = self.connection.lock().await;
        if let Some(connection) = connection_guard.as_ref() {
            if connection.status().connected() {
                let mut channel_guard = self.channel.lock().await;
                let channel_alive = channel_guard
                    .as_ref()
                    .is_some_and(|channel| channel.status().connected());
                if !channel_alive {
                    let channel = connection.create_channel().await?;
                    channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
                    *channel_guard = Some(channel);
                }
                *self.state.write().unwrap() = PortState::Open;
                return Ok(());
            }
        }

        let connection = Self::create_connection(&self.uri).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;

        *connection_guard = Some(connection);
        *self.channel.lock().await = Some(channel);
        *self.state.write().unwrap() = PortState::Open;
        Ok(())
    }

    async fn create_connection(addr: &str) -> Result<Connection, RabbitMQError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        backoff::future::retry(backoff, || async {
            info!("Attempting to connect to RabbitMQ");
            Connection::connect(addr, ConnectionProperties::default())
                .await
                .map_err(BackoffError::transient)
        })
        .await
        .map_err(|e| RabbitMQError::Backoff(e.to_string()))
    }

    async fn channel(&self) -> Result<Channel, RabbitMQError> {
        match self.channel.lock().await.as_ref() {
            Some(channel) if channel.status().connected() => Ok(channel.clone()),
            _ => Err(RabbitMQError::NotConnected),
        }
    }

    /// Publishes one event. The body is the JSON payload only; the envelope
    /// travels as AMQP properties with `x-message-id`/`x-event-type` mirrored
    /// into headers for hops that do not preserve properties.
    pub async fn publish(
        &self,
        destination: &str,
        event: &EventMessage,
        options: &PublishOptions,
    ) -> Result<(), RabbitMQError> {
        let channel = self.channel().await?;

        let (exchange, routing_key) = match &options.exchange {
            Some(exchange) => {
                channel
                    .exchange_declare(
                        &exchange.name,
                        exchange.kind.clone(),
                        ExchangeDeclareOptions {
                            durable: exchange.durable,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
                (
                    exchange.name.as_str(),
                    event.routing_key.as_deref().unwrap_or(""),
                )
            }
            None => ("", destination),
        };

        let body = serde_json::to_vec(&event.payload)?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                build_properties(event),
            )
            .await?;
        Ok(())
    }

    /// Starts consuming `queue`. Each delivery is decoded into an
    /// `EventMessage` and handed to `on_message`; `Ok` acks the delivery iff
    /// the channel is still connected, `Err` nacks it without requeue so the
    /// broker dead-letters through the configured DLX. Returns the consumer
    /// tag.
    pub async fn consume(
        self: &Arc<Self>,
        queue: &str,
        on_message: MessageCallback,
    ) -> Result<String, RabbitMQError> {
        let channel = self.channel().await?;
        let tag = format!("{queue}-{}", Uuid::now_v7());

        let mut consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.consumer_tags.lock().await.push(tag.clone());

        let port = Arc::clone(self);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("Error receiving message: {:?}", e);
                        continue;
                    }
                };

                port.in_flight.fetch_add(1, Ordering::SeqCst);
                let port = Arc::clone(&port);
                let on_message = Arc::clone(&on_message);
                tokio::spawn(async move {
                    port.handle_delivery(delivery, on_message).await;
                    port.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            debug!("Consumer loop for queue {queue} ended");
        });

        Ok(tag)
    }

    async fn handle_delivery(&self, delivery: Delivery, on_message: MessageCallback) {
        let event = match decode_delivery(&delivery) {
            Ok(event) => event,
            Err(e) => {
                error!("Failed to decode delivery: {:?}", e);
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
                {
                    warn!("Failed to nack undecodable delivery: {:?}", e);
                }
                return;
            }
        };

        match on_message(event).await {
            Ok(()) => {
                if !self.is_connected().await {
                    warn!("Channel closed before ack; the broker will redeliver");
                    return;
                }
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!("Failed to ack delivery: {:?}", e);
                }
            }
            Err(e) => {
                debug!("Handler failed, nacking without requeue: {e}");
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
                {
                    warn!("Failed to nack delivery: {:?}", e);
                }
            }
        }
    }

    /// Passive declare returning the current message count. Doubles as the
    /// heartbeat probe.
    pub async fn check_queue(&self, queue: &str) -> Result<u32, RabbitMQError> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count())
    }

    pub(crate) async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), RabbitMQError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                arguments,
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn declare_exchange(
        &self,
        exchange: &ExchangeConfig,
    ) -> Result<(), RabbitMQError> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.clone(),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Cancels every registered consumer; already-cancelled consumers are
    /// tolerated.
    pub async fn cancel_all_consumers(&self) {
        let tags: Vec<String> = self.consumer_tags.lock().await.drain(..).collect();
        if tags.is_empty() {
            return;
        }
        let channel = match self.channel().await {
            Ok(channel) => channel,
            Err(_) => return,
        };
        for tag in tags {
            if let Err(e) = channel.basic_cancel(&tag, BasicCancelOptions::default()).await {
                warn!("Failed to cancel consumer {tag}: {:?}", e);
            }
        }
    }

    async fn drain_in_flight(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Idempotent teardown: cancel consumers, wait for in-flight deliveries,
    /// close channel and connection. A closed port remains safely closable.
    pub async fn disconnect(&self) {
        if self.state() == PortState::Closed {
            return;
        }
        self.cancel_all_consumers().await;
        self.drain_in_flight().await;

        if let Some(channel) = self.channel.lock().await.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(0, "disconnect").await {
                    warn!("Error closing channel: {:?}", e);
                }
            }
        }
        if let Some(connection) = self.connection.lock().await.take() {
            if connection.status().connected() {
                if let Err(e) = connection.close(0, "disconnect").await {
                    warn!("Error closing connection: {:?}", e);
                }
            }
        }
        *self.state.write().unwrap() = PortState::Closed;
        debug!("Broker port closed");
    }
}

pub(crate) fn build_properties(event: &EventMessage) -> BasicProperties {
    let mut headers = json_headers_to_field_table(&event.properties.headers);
    headers.insert(
        Header::MESSAGE_ID.into(),
        AMQPValue::LongString(event.message_id.as_str().into()),
    );
    headers.insert(
        Header::EVENT_TYPE.into(),
        AMQPValue::LongString(event.event_type.as_str().into()),
    );

    let mut properties = BasicProperties::default()
        .with_message_id(event.message_id.as_str().into())
        .with_kind(event.event_type.as_str().into())
        .with_content_type(
            event
                .properties
                .content_type
                .as_deref()
                .unwrap_or("application/json")
                .into(),
        )
        .with_delivery_mode(event.properties.delivery_mode.unwrap_or(2)) // persistent
        .with_headers(headers);

    if let Some(timestamp) = event.properties.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(correlation_id) = &event.properties.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    properties
}

pub(crate) fn decode_delivery(delivery: &Delivery) -> Result<EventMessage, RabbitMQError> {
    let payload: Value = serde_json::from_slice(&delivery.data)?;
    let headers = field_table_to_json(&delivery.properties.headers().clone().unwrap_or_default());

    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .or_else(|| {
            headers
                .get(Header::MESSAGE_ID)
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            warn!("Message is missing message_id, generating a new UUID v7");
            Uuid::now_v7().to_string()
        });

    let event_type = delivery
        .properties
        .kind()
        .as_ref()
        .map(|kind| kind.to_string())
        .or_else(|| {
            headers
                .get(Header::EVENT_TYPE)
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    if event_type.is_empty() {
        warn!("Message {message_id} carries no event type");
    }

    let mut event = EventMessage::new(message_id, event_type, payload);
    event.routing_key =
        Some(delivery.routing_key.to_string()).filter(|routing_key| !routing_key.is_empty());
    event.properties = MessageProperties {
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.to_string()),
        delivery_mode: *delivery.properties.delivery_mode(),
        timestamp: *delivery.properties.timestamp(),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|correlation_id| correlation_id.to_string()),
        headers,
    };
    Ok(event)
}

pub(crate) fn field_table_to_json(table: &FieldTable) -> HashMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
        .collect()
}

fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Float(f) => Value::from(f64::from(*f)),
        AMQPValue::Double(d) => Value::from(*d),
        AMQPValue::ShortString(s) => Value::String(s.to_string()),
        AMQPValue::LongString(s) => Value::String(s.to_string()),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::FieldArray(array) => Value::Array(
            array
                .as_slice()
                .iter()
                .map(amqp_value_to_json)
                .collect(),
        ),
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

pub(crate) fn json_headers_to_field_table(headers: &HashMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), json_value_to_amqp(value));
    }
    table
}

fn json_value_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Array(values) => {
            let mut array = FieldArray::default();
            for value in values {
                array.push(json_value_to_amqp(value));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.as_str().into(), json_value_to_amqp(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}
