use crate::config::PublisherConfig;
use crate::connection::{MessageQueue, PublishOptions, RabbitMQError};
use crate::events::{EventMessage, EventStatus};
use crate::store::{probe_store, EventStore, PendingEventStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-call publish options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishCallOptions {
    /// Persist as PENDING and return without dispatching; the pending
    /// scanner picks the event up later.
    pub store_only: bool,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn sort_by_timestamp(events: &mut [EventMessage]) {
    events.sort_by_key(|event| event.properties.timestamp.unwrap_or(0));
}

/// Publishes events through its own broker port, with store-backed
/// deduplication and persist-then-dispatch semantics. In deferred mode
/// (`instant_publish = false`) publishes only persist and a scanner drains
/// the PENDING backlog.
#[derive(Clone)]
pub struct EventPublisher {
    config: Arc<PublisherConfig>,
    port: Arc<MessageQueue>,
    store: Option<Arc<dyn EventStore>>,
    pending_store: Option<Arc<dyn PendingEventStore>>,
    store_confirmed: Arc<AtomicBool>,
    idle_timer: Arc<StdMutex<Option<JoinHandle<()>>>>,
    ticker: Arc<StdMutex<Option<JoinHandle<()>>>>,
    shutdown: Arc<AtomicBool>,
}

impl EventPublisher {
    /// A publisher without a store: every publish dispatches immediately and
    /// nothing is deduplicated or recovered.
    pub fn new(config: PublisherConfig) -> Result<Self, RabbitMQError> {
        Self::build(config, None, None)
    }

    /// A publisher over a basic store. Instant mode only: deferred mode
    /// needs a store that lists pending events, use
    /// [`EventPublisher::with_pending_store`].
    pub fn with_store(
        config: PublisherConfig,
        store: Arc<dyn EventStore>,
    ) -> Result<Self, RabbitMQError> {
        Self::build(config, Some(store), None)
    }

    /// A publisher over a store with the pending-listing capability; required
    /// for deferred mode and for `process_pending_events`.
    pub fn with_pending_store<S>(config: PublisherConfig, store: Arc<S>) -> Result<Self, RabbitMQError>
    where
        S: PendingEventStore + 'static,
    {
        let event_store: Arc<dyn EventStore> = store.clone();
        let pending_store: Arc<dyn PendingEventStore> = store;
        Self::build(config, Some(event_store), Some(pending_store))
    }

    fn build(
        config: PublisherConfig,
        store: Option<Arc<dyn EventStore>>,
        pending_store: Option<Arc<dyn PendingEventStore>>,
    ) -> Result<Self, RabbitMQError> {
        config.validate()?;
        if !config.instant_publish && pending_store.is_none() {
            return Err(RabbitMQError::InvalidConfig(
                "deferred publishing requires a store that lists pending events".to_string(),
            ));
        }

        let publisher = Self {
            port: Arc::new(MessageQueue::new(config.connection.uri())),
            config: Arc::new(config),
            store,
            pending_store,
            store_confirmed: Arc::new(AtomicBool::new(false)),
            idle_timer: Arc::new(StdMutex::new(None)),
            ticker: Arc::new(StdMutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        if !publisher.config.instant_publish && !publisher.config.pending_check_interval.is_zero() {
            publisher.start_pending_ticker();
        }
        Ok(publisher)
    }

    pub async fn publish(&self, event: &EventMessage) -> Result<(), RabbitMQError> {
        self.publish_with_options(event, PublishCallOptions::default())
            .await
    }

    /// Dedupe, persist PENDING, dispatch, mark PUBLISHED. Rejects with the
    /// underlying error when the event was neither persisted nor dispatched;
    /// a failure after persisting marks the event ERROR best-effort and
    /// rethrows.
    pub async fn publish_with_options(
        &self,
        event: &EventMessage,
        options: PublishCallOptions,
    ) -> Result<(), RabbitMQError> {
        self.ensure_store_reachable().await?;

        let mut event = event.clone();
        if let Some(store) = &self.store {
            if store.get_event(&event).await?.is_some() {
                info!("Duplicate publish of {} skipped", event.message_id);
                return Ok(());
            }
        }

        if let Err(error) = self.persist_and_dispatch(&mut event, options).await {
            if let Some(store) = &self.store {
                if let Err(e) = store.update_event_status(&event, EventStatus::Error).await {
                    warn!("Failed to mark event {} as errored: {e}", event.message_id);
                }
            }
            return Err(error);
        }
        Ok(())
    }

    async fn persist_and_dispatch(
        &self,
        event: &mut EventMessage,
        options: PublishCallOptions,
    ) -> Result<(), RabbitMQError> {
        if let Some(store) = &self.store {
            event.status = Some(EventStatus::Pending);
            if event.properties.timestamp.is_none() {
                event.properties.timestamp = Some(unix_millis());
            }
            store.save_event(event).await?;

            if options.store_only {
                debug!("Event {} stored for later dispatch", event.message_id);
                return Ok(());
            }
            if !self.config.instant_publish {
                debug!("Deferred mode: event {} stored as pending", event.message_id);
                return Ok(());
            }
        }

        self.ensure_connected().await?;
        self.dispatch(event).await?;
        self.arm_idle_timer();

        if let Some(store) = &self.store {
            store
                .update_event_status(event, EventStatus::Published)
                .await?;
        }
        Ok(())
    }

    async fn dispatch(&self, event: &EventMessage) -> Result<(), RabbitMQError> {
        // when both are configured the exchange wins; the queue name is only
        // the default destination name
        let destination = self.config.queue.clone().unwrap_or_else(|| {
            self.config
                .exchange
                .as_ref()
                .map(|exchange| exchange.name.clone())
                .unwrap_or_default()
        });
        self.port
            .publish(
                &destination,
                event,
                &PublishOptions {
                    exchange: self.config.exchange.clone(),
                },
            )
            .await
    }

    /// Drains the PENDING backlog in ascending timestamp order, marking each
    /// event PUBLISHED or ERROR and continuing through failures.
    pub async fn process_pending_events(&self) -> Result<(), RabbitMQError> {
        let Some(store) = &self.pending_store else {
            return Err(RabbitMQError::InvalidConfig(
                "the configured store does not list pending events".to_string(),
            ));
        };
        self.ensure_store_reachable().await?;

        let mut pending = store.get_pending_events(EventStatus::Pending).await?;
        if pending.is_empty() {
            debug!("No pending events to dispatch");
            return Ok(());
        }
        sort_by_timestamp(&mut pending);

        self.ensure_connected().await?;
        info!("Dispatching {} pending events", pending.len());
        for event in &pending {
            match self.dispatch(event).await {
                Ok(()) => {
                    if let Err(e) = store
                        .update_event_status(event, EventStatus::Published)
                        .await
                    {
                        warn!("Failed to mark {} as published: {e}", event.message_id);
                    }
                }
                Err(error) => {
                    warn!(
                        "Failed to publish pending event {}: {:?}",
                        event.message_id, error
                    );
                    if let Err(e) = store.update_event_status(event, EventStatus::Error).await {
                        warn!("Failed to mark {} as errored: {e}", event.message_id);
                    }
                }
            }
        }
        self.port.disconnect().await;
        Ok(())
    }

    async fn ensure_store_reachable(&self) -> Result<(), RabbitMQError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.store_confirmed.load(Ordering::SeqCst) {
            return Ok(());
        }
        probe_store(
            store.as_ref(),
            self.config.store_connection_retries,
            self.config.store_connection_retry_delay,
        )
        .await?;
        self.store_confirmed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), RabbitMQError> {
        if !self.port.is_connected().await {
            self.port.connect(0).await?;
        }
        Ok(())
    }

    /// Arms (or re-arms) the idle reaper: after `idle_timeout` without a
    /// publish the broker connection is closed. The next publish reconnects
    /// transparently.
    fn arm_idle_timer(&self) {
        if self.config.idle_timeout.is_zero() {
            return;
        }
        let mut timer = self.idle_timer.lock().unwrap();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let port = Arc::clone(&self.port);
        let idle_timeout = self.config.idle_timeout;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            debug!("Publisher idle for {idle_timeout:?}, closing the broker connection");
            port.disconnect().await;
        }));
    }

    fn start_pending_ticker(&self) {
        let publisher = self.clone();
        let interval = self.config.pending_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                if publisher.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = publisher.process_pending_events().await {
                    warn!("Pending events scan failed: {:?}", e);
                }
            }
        });
        *self.ticker.lock().unwrap() = Some(handle);
    }

    /// Stops the ticker and the idle reaper and closes the broker port.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.idle_timer.lock().unwrap().take() {
            handle.abort();
        }
        self.port.disconnect().await;
    }
}
