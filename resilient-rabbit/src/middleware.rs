use crate::events::EventMessage;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
pub type EventHandlerFn = Arc<dyn Fn(EventMessage) -> HandlerFuture + Send + Sync>;

/// One entry of the handler registry: events whose type equals `event_type`
/// are dispatched to `handler`. When several entries share a type, the first
/// match wins.
#[derive(Clone)]
pub struct EventHandlerEntry {
    pub event_type: String,
    pub handler: EventHandlerFn,
}

/// Builds a registry entry from an async closure.
pub fn on_event<F, Fut>(event_type: impl Into<String>, handler: F) -> EventHandlerEntry
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    EventHandlerEntry {
        event_type: event_type.into(),
        handler: Arc::new(move |event: EventMessage| -> HandlerFuture {
            Box::pin(handler(event))
        }),
    }
}

/// A per-event interceptor. Composition is onion-style:
/// `m1(m2(...mN(handler)))`. A middleware either awaits `next.run(event)` or
/// returns without it, which terminates the chain with its own result.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, event: &EventMessage, next: Next<'_>) -> Result<(), HandlerError>;
}

/// Cursor over the remaining chain, ending in the handler endpoint.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a (dyn Fn(&EventMessage) -> HandlerFuture + Send + Sync),
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn Middleware>],
        endpoint: &'a (dyn Fn(&EventMessage) -> HandlerFuture + Send + Sync),
    ) -> Self {
        Self { chain, endpoint }
    }

    /// Advances into the next middleware, or into the handler once the chain
    /// is exhausted. An empty chain invokes the handler directly.
    pub async fn run(mut self, event: &EventMessage) -> Result<(), HandlerError> {
        if let Some((current, rest)) = self.chain.split_first() {
            self.chain = rest;
            current.handle(event, self).await
        } else {
            (self.endpoint)(event).await
        }
    }
}
