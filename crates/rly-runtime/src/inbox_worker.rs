//! Inbox consumer worker
//!
//! Subscribes to a set of transport destinations. Each delivery is decoded
//! through the serializer registry, checked against the dedup table, and
//! recorded in the durable inbox via the strategy; the handler then runs on
//! the claimed row, under lease, inside a per-message scope. Completions,
//! failures, and any handler-produced events ride the same flush, keeping
//! the business change, outgoing events, and inbox completion in one
//! transactional envelope.
//!
//! A recovery tick claims rows whose leases expired on other instances, so
//! a crashed peer's inbox work is picked up without any extra machinery.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use rly_domain::{
    Envelope, InboxWork, MessageCompletion, MessageFailure, MessageMetadata, NewInboxMessage,
    NewOutboxMessage, StatusFlags, StreamId, WorkError,
};
use rly_ports::{
    AckDisposition, CoordinatorError, DispatchRequest, Dispatcher, EventStore, PauseHandle,
    Subscription, Transport, TransportDelivery, WorkCoordinator,
};

use crate::registry::SerializerRegistry;
use crate::scope::ScopeFactory;
use crate::strategy::CoordinatorStrategy;

/// Inbox worker tunables
#[derive(Debug, Clone)]
pub struct InboxWorkerConfig {
    /// Destinations to subscribe to
    pub destinations: Vec<String>,
    /// Recovery/report tick while idle (default: 1 s)
    pub recovery_interval_ms: u64,
    /// Bound on the final drain flush at shutdown (default: 5 s)
    pub drain_timeout_ms: u64,
    /// Initial backoff after a store error (default: 250 ms)
    pub backoff_initial_ms: u64,
    /// Backoff cap (default: 30 s)
    pub backoff_max_ms: u64,
}

impl Default for InboxWorkerConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            recovery_interval_ms: 1_000,
            drain_timeout_ms: 5_000,
            backoff_initial_ms: 250,
            backoff_max_ms: 30_000,
        }
    }
}

impl InboxWorkerConfig {
    pub fn for_destinations(destinations: Vec<String>) -> Self {
        Self {
            destinations,
            ..Self::default()
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inbox consumer worker
pub struct InboxConsumerWorker<C, T, D, E>
where
    C: WorkCoordinator,
    T: Transport,
    D: Dispatcher,
    E: EventStore,
{
    strategy: Arc<CoordinatorStrategy<C>>,
    transport: Arc<T>,
    dispatcher: Arc<D>,
    event_store: Arc<E>,
    registry: Arc<SerializerRegistry>,
    scopes: ScopeFactory,
    config: InboxWorkerConfig,
    pause_handles: Mutex<Vec<PauseHandle>>,
}

impl<C, T, D, E> InboxConsumerWorker<C, T, D, E>
where
    C: WorkCoordinator + 'static,
    T: Transport + 'static,
    D: Dispatcher + 'static,
    E: EventStore + 'static,
{
    pub fn new(
        strategy: Arc<CoordinatorStrategy<C>>,
        transport: Arc<T>,
        dispatcher: Arc<D>,
        event_store: Arc<E>,
        registry: Arc<SerializerRegistry>,
        scopes: ScopeFactory,
        config: InboxWorkerConfig,
    ) -> Self {
        Self {
            strategy,
            transport,
            dispatcher,
            event_store,
            registry,
            scopes,
            config,
            pause_handles: Mutex::new(Vec::new()),
        }
    }

    /// Pause delivery on every subscription; idempotent
    pub fn pause_all(&self) {
        for handle in locked(&self.pause_handles).iter() {
            handle.pause();
        }
    }

    /// Resume delivery on every subscription; idempotent
    pub fn resume_all(&self) {
        for handle in locked(&self.pause_handles).iter() {
            handle.resume();
        }
    }

    /// Run until the shutdown signal flips, then drain
    #[instrument(skip(self, shutdown), fields(instance_id = %self.strategy.instance().instance_id))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            destinations = ?self.config.destinations,
            "Inbox consumer started"
        );

        let mut tasks = Vec::new();
        for destination in &self.config.destinations {
            match self.transport.subscribe(destination).await {
                Ok(subscription) => {
                    locked(&self.pause_handles).push(subscription.pause_handle());
                    let worker = self.clone();
                    let signal = shutdown.clone();
                    tasks.push(tokio::spawn(async move {
                        worker.delivery_loop(subscription, signal).await;
                    }));
                }
                Err(e) => {
                    error!(destination = %destination, error = %e, "Subscribe failed");
                }
            }
        }

        let mut backoff_ms = self.config.backoff_initial_ms;
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Recovery tick: commits reports queued by delivery tasks and
            // claims rows whose leases expired elsewhere.
            match self.pump().await {
                Ok(_) => {
                    backoff_ms = self.config.backoff_initial_ms;
                    idle(self.config.recovery_interval_ms, &mut shutdown).await;
                }
                Err(e) => {
                    error!(error = %e, backoff_ms, "Recovery flush failed; backing off");
                    idle(backoff_ms, &mut shutdown).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.backoff_max_ms);
                }
            }
        }

        // Graceful drain: stop delivery first, then report what completed.
        self.pause_all();
        for task in &tasks {
            task.abort();
        }
        match tokio::time::timeout(
            Duration::from_millis(self.config.drain_timeout_ms),
            self.strategy.flush(),
        )
        .await
        {
            Ok(Ok(_)) => debug!("Drain flush completed"),
            Ok(Err(e)) => warn!(error = %e, "Drain flush failed; leases will expire"),
            Err(_) => warn!("Drain flush timed out; leases will expire"),
        }
        info!("Inbox consumer stopped");
    }

    async fn delivery_loop(
        self: Arc<Self>,
        mut subscription: Box<dyn Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        subscription.dispose();
                        break;
                    }
                }
                delivery = subscription.next() => {
                    match delivery {
                        Some(delivery) => {
                            let disposition = self.handle_delivery(delivery).await;
                            subscription.settle(disposition).await;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// One transport delivery: decode, dedup, record, then process whatever
    /// the coordinator hands back.
    ///
    /// The returned disposition settles the delivery on the transport:
    /// accepted only once the inbox row is durable (or already deduped),
    /// retried while the store is unreachable, rejected for payloads no
    /// redelivery can fix.
    #[instrument(skip(self, delivery), fields(destination = %delivery.destination, envelope_type = %delivery.envelope_type))]
    async fn handle_delivery(&self, delivery: TransportDelivery) -> AckDisposition {
        let envelope = match self
            .registry
            .decode_envelope(&delivery.envelope_type, &delivery.payload)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                // Nothing durable exists yet; terminal by policy
                error!(error = %e, "Failed to decode delivery");
                return AckDisposition::Reject;
            }
        };

        let Some(handler_name) = self.dispatcher.handler_name_for(&delivery.envelope_type) else {
            error!("No handler registered; delivery dropped");
            return AckDisposition::Reject;
        };

        match self.strategy.is_duplicate(&envelope.message_id).await {
            Ok(true) => {
                debug!(message_id = %envelope.message_id, "Duplicate delivery skipped");
                return AckDisposition::Accept;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "Dedup check failed");
                return AckDisposition::Retry;
            }
        }

        let stream_id = if delivery.stream_id.is_empty() {
            // No ordering key on the wire: the message forms its own stream
            StreamId::from_string(envelope.message_id.as_str().to_string())
        } else {
            StreamId::from_string(delivery.stream_id.clone())
        };

        // Correlation travels in the hop trail
        let metadata = envelope
            .hops
            .last()
            .map(|hop| MessageMetadata {
                correlation_id: hop.correlation_id.clone(),
                causation_id: hop.causation_id.clone(),
                user_scope: None,
            })
            .unwrap_or_default();

        let envelope_value = match serde_json::to_value(&envelope) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Failed to re-serialize envelope");
                return AckDisposition::Reject;
            }
        };

        self.strategy.queue_inbox_message(NewInboxMessage {
            message_id: envelope.message_id.clone(),
            handler_name,
            envelope_type: delivery.envelope_type.clone(),
            envelope: envelope_value,
            metadata: metadata.to_value(),
            stream_id,
        });

        if let Err(e) = self.pump().await {
            // Not durable yet: the insert stays queued for the recovery
            // tick, and the unacked delivery redelivers; the dedup row
            // collapses whichever lands second.
            error!(error = %e, "Flush after delivery failed");
            return AckDisposition::Retry;
        }

        AckDisposition::Accept
    }

    /// Flush and process claimed inbox work until the store goes quiet
    async fn pump(&self) -> Result<(), CoordinatorError> {
        let mut seen: HashSet<rly_domain::MessageId> = HashSet::new();
        loop {
            self.strategy.flush().await?;
            let work = self.strategy.take_inbox_work();
            if work.is_empty() {
                return Ok(());
            }
            let mut progressed = false;
            for item in work {
                if seen.insert(item.message_id.clone()) {
                    progressed = true;
                    self.process_inbox_work(item).await;
                } else {
                    // Re-claimed within one pump (a failing row); release it
                    // and let the next recovery tick retry.
                    self.strategy
                        .queue_inbox_completion(MessageCompletion::release(item.message_id));
                }
            }
            if !progressed {
                self.strategy.flush().await?;
                return Ok(());
            }
        }
    }

    /// Invoke the handler for one claimed inbox row inside its scope
    #[instrument(skip(self, work), fields(message_id = %work.message_id, handler = %work.handler_name))]
    async fn process_inbox_work(&self, work: InboxWork) {
        let _scope = self.scopes.open(work.message_id.clone());

        let envelope: Envelope = match serde_json::from_value(work.envelope.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.strategy.queue_inbox_failure(MessageFailure::new(
                    work.message_id.clone(),
                    StatusFlags::STORED,
                    WorkError::serialization(e.to_string()).to_string(),
                ));
                return;
            }
        };
        let metadata = MessageMetadata::from_value(&work.metadata);

        let request = DispatchRequest {
            handler_name: work.handler_name.clone(),
            envelope_type: work.envelope_type.clone(),
            envelope,
            metadata: metadata.clone(),
            stream_id: work.stream_id.clone(),
        };

        let outcome = match self.dispatcher.dispatch(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Handler failed");
                self.strategy.queue_inbox_failure(MessageFailure::new(
                    work.message_id.clone(),
                    StatusFlags::STORED,
                    e.to_string(),
                ));
                return;
            }
        };

        // Event cascade: append each event to the log, then queue it for
        // the outbox. Outbox messages are queued only after every append
        // succeeded, so a mid-cascade failure leaves nothing half-queued.
        let mut produced: Vec<NewOutboxMessage> = Vec::with_capacity(outcome.events.len());
        for event in outcome.events {
            let event_metadata = metadata.caused_by(&work.message_id);
            let mut event_envelope = Envelope::new(event.payload);
            event_envelope.record_hop(
                "Sent",
                &self.strategy.instance().instance_id,
                &event_metadata,
                Utc::now(),
            );

            if let Err(e) = self.event_store.append(&event.stream_id, &event_envelope).await {
                warn!(error = %e, "Event append failed");
                self.strategy.queue_inbox_failure(MessageFailure::new(
                    work.message_id.clone(),
                    StatusFlags::STORED,
                    WorkError::unknown(e.to_string()).to_string(),
                ));
                return;
            }

            let envelope_value = match serde_json::to_value(&event_envelope) {
                Ok(value) => value,
                Err(e) => {
                    self.strategy.queue_inbox_failure(MessageFailure::new(
                        work.message_id.clone(),
                        StatusFlags::STORED,
                        WorkError::serialization(e.to_string()).to_string(),
                    ));
                    return;
                }
            };

            produced.push(NewOutboxMessage {
                message_id: event_envelope.message_id.clone(),
                destination: event.destination,
                envelope_type: event.envelope_type,
                envelope: envelope_value,
                metadata: event_metadata.to_value(),
                stream_id: event.stream_id,
            });
        }

        for message in produced {
            self.strategy.queue_outbox_message(message);
        }

        debug!(handler = %work.handler_name, "Inbox message handled");
        self.strategy.queue_inbox_completion(MessageCompletion::new(
            work.message_id.clone(),
            StatusFlags::STORED | StatusFlags::EVENT_STORED | StatusFlags::PUBLISHED,
        ));
    }
}

async fn idle(ms: u64, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        _ = shutdown.changed() => {}
    }
}
