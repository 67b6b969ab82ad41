//! Outbox publisher worker
//!
//! Long-running loop: wait for the transport to be ready, flush the
//! strategy, publish the claimed batch, report each result on the next
//! flush. Publishing is parallel across streams and sequential within one —
//! batch order is the per-stream order the coordinator guarantees, and the
//! worker must not reorder it.
//!
//! A transport that goes not-ready mid-batch makes the worker yield its
//! remaining messages with the zero-status release sentinel instead of
//! burning attempts. A publish failure stops the rest of that stream; the
//! store's failure cascade releases those rows when the failure report
//! lands.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use rly_domain::{
    MessageCompletion, MessageFailure, MessageId, OutboxWork, StatusFlags, StreamId, WorkError,
};
use rly_ports::{Transport, WorkCoordinator};

use crate::strategy::CoordinatorStrategy;

/// Outbox worker tunables
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// Sleep between polls when no work was claimed (default: 50 ms)
    pub idle_delay_ms: u64,
    /// Retry interval while the transport is not ready (default: 1 s)
    pub ready_retry_ms: u64,
    /// Bound on the final drain flush at shutdown (default: 5 s)
    pub drain_timeout_ms: u64,
    /// Initial backoff after a store error (default: 250 ms)
    pub backoff_initial_ms: u64,
    /// Backoff cap (default: 30 s)
    pub backoff_max_ms: u64,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            idle_delay_ms: 50,
            ready_retry_ms: 1_000,
            drain_timeout_ms: 5_000,
            backoff_initial_ms: 250,
            backoff_max_ms: 30_000,
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Group a claimed batch by stream, preserving batch order within each
/// group and the first-appearance order across groups
fn group_by_stream(work: Vec<OutboxWork>) -> Vec<Vec<OutboxWork>> {
    let mut groups: Vec<Vec<OutboxWork>> = Vec::new();
    let mut index: HashMap<StreamId, usize> = HashMap::new();
    for item in work {
        match index.get(&item.stream_id) {
            Some(&i) => groups[i].push(item),
            None => {
                index.insert(item.stream_id.clone(), groups.len());
                groups.push(vec![item]);
            }
        }
    }
    groups
}

/// Outbox publisher worker
pub struct OutboxPublisherWorker<C: WorkCoordinator, T: Transport> {
    strategy: Arc<CoordinatorStrategy<C>>,
    transport: Arc<T>,
    config: OutboxWorkerConfig,
}

impl<C, T> OutboxPublisherWorker<C, T>
where
    C: WorkCoordinator + 'static,
    T: Transport,
{
    pub fn new(
        strategy: Arc<CoordinatorStrategy<C>>,
        transport: Arc<T>,
        config: OutboxWorkerConfig,
    ) -> Self {
        Self {
            strategy,
            transport,
            config,
        }
    }

    /// Run until the shutdown signal flips, then drain
    #[instrument(skip(self, shutdown), fields(instance_id = %self.strategy.instance().instance_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Outbox publisher started");
        let mut backoff_ms = self.config.backoff_initial_ms;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.transport.ready().await {
                debug!("Transport not ready; retrying");
                idle(self.config.ready_retry_ms, &mut shutdown).await;
                continue;
            }

            match self.strategy.flush().await {
                Ok(_) => backoff_ms = self.config.backoff_initial_ms,
                Err(e) => {
                    error!(error = %e, backoff_ms, "Flush failed; backing off");
                    idle(backoff_ms, &mut shutdown).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.backoff_max_ms);
                    continue;
                }
            }

            let work = self.strategy.take_outbox_work();
            if work.is_empty() {
                idle(self.config.idle_delay_ms, &mut shutdown).await;
                continue;
            }

            self.publish_batch(work).await;
        }

        self.drain().await;
        info!("Outbox publisher stopped");
    }

    async fn publish_batch(&self, work: Vec<OutboxWork>) {
        debug!(count = work.len(), "Publishing outbox batch");

        let in_flight: Arc<Mutex<HashSet<MessageId>>> = Arc::new(Mutex::new(
            work.iter().map(|w| w.message_id.clone()).collect(),
        ));
        let renewal_guard = self.spawn_renewal_guard(in_flight.clone());

        let groups = group_by_stream(work);
        join_all(
            groups
                .into_iter()
                .map(|group| self.publish_stream(group, in_flight.clone())),
        )
        .await;

        locked(&in_flight).clear();
        renewal_guard.abort();
    }

    /// Keep leases alive while a batch is in flight longer than half the
    /// lease window
    fn spawn_renewal_guard(&self, in_flight: Arc<Mutex<HashSet<MessageId>>>) -> JoinHandle<()> {
        let strategy = self.strategy.clone();
        let interval =
            Duration::from_secs(u64::from(strategy.options().lease_seconds / 2).max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let ids: Vec<MessageId> = locked(&in_flight).iter().cloned().collect();
                if ids.is_empty() {
                    break;
                }
                debug!(count = ids.len(), "Renewing leases for in-flight publishes");
                if let Err(e) = strategy.renew_leases(ids, Vec::new()).await {
                    warn!(error = %e, "Lease renewal failed");
                }
            }
        })
    }

    async fn publish_stream(
        &self,
        group: Vec<OutboxWork>,
        in_flight: Arc<Mutex<HashSet<MessageId>>>,
    ) {
        // After a yield the rest of the stream is released untouched; after
        // a failure the rest is left leased for the cascade to free.
        let mut yield_rest = false;
        let mut stop_rest = false;

        for item in group {
            locked(&in_flight).remove(&item.message_id);

            if stop_rest {
                continue;
            }
            if yield_rest {
                self.strategy
                    .queue_outbox_completion(MessageCompletion::release(item.message_id));
                continue;
            }

            if !self.transport.ready().await {
                self.strategy
                    .queue_outbox_completion(MessageCompletion::release(item.message_id));
                yield_rest = true;
                continue;
            }

            let payload = match serde_json::to_vec(&item.envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    self.strategy.queue_outbox_failure(MessageFailure::new(
                        item.message_id.clone(),
                        StatusFlags::STORED,
                        WorkError::serialization(e.to_string()).to_string(),
                    ));
                    stop_rest = true;
                    continue;
                }
            };

            match self
                .transport
                .publish(
                    &item.destination,
                    &item.envelope_type,
                    item.stream_id.as_str(),
                    &payload,
                )
                .await
            {
                Ok(()) => {
                    debug!(
                        message_id = %item.message_id,
                        destination = %item.destination,
                        "Message published"
                    );
                    self.strategy.queue_outbox_completion(MessageCompletion::new(
                        item.message_id,
                        StatusFlags::PUBLISHED,
                    ));
                }
                Err(e) => {
                    warn!(
                        message_id = %item.message_id,
                        error = %e,
                        "Publish failed"
                    );
                    self.strategy.queue_outbox_failure(MessageFailure::new(
                        item.message_id.clone(),
                        StatusFlags::STORED,
                        WorkError::transport(e.to_string()).to_string(),
                    ));
                    stop_rest = true;
                }
            }
        }
    }

    /// Report whatever completed and give unattempted claims back
    async fn drain(&self) {
        for item in self.strategy.take_outbox_work() {
            self.strategy
                .queue_outbox_completion(MessageCompletion::release(item.message_id));
        }
        if !self.strategy.has_pending() {
            return;
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
    }
}

async fn idle(ms: u64, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        _ = shutdown.changed() => {}
    }
}
