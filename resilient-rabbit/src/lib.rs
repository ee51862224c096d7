pub mod config;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod events;
pub mod hooks;
pub mod middleware;
mod processor;
pub mod publisher;
pub mod store;

#[cfg(test)]
mod test;

pub use config::{
    ConnectionConfig, ConsumeQueueConfig, ConsumerConfig, DeadLetterQueueConfig, ExchangeConfig,
    PublisherConfig, RetryQueueConfig,
};
pub use connection::{MessageQueue, PortState, PublishOptions, RabbitMQError};
pub use consumer::EventConsumer;
pub use dead_letter::publish_to_dead_letter_queue;
pub use events::{EventMessage, EventStatus, Header, MessageProperties};
pub use hooks::{HookDecision, LifecycleHooks};
pub use middleware::{on_event, EventHandlerEntry, HandlerError, Middleware, Next};
pub use publisher::{EventPublisher, PublishCallOptions};
pub use store::{EventStore, PendingEventStore, StoreError};
