//! Single-instance happy path: a stored message is claimed, published via
//! the transport, and marked published on the next flush.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use common::{descriptor, new_outbox_message, wait_until};
use rly_adapters::{InMemoryWorkStore, InProcessTransport};
use rly_domain::{MessageId, StatusFlags, WorkBatchOptions, WorkBatchRequest};
use rly_ports::{Subscription as _, Transport, WorkCoordinator};
use rly_runtime::{CoordinatorStrategy, OutboxPublisherWorker, OutboxWorkerConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_message_is_published_exactly_through_the_worker() {
    let store = Arc::new(InMemoryWorkStore::new());
    let transport = Arc::new(InProcessTransport::new());
    let mut subscription = transport.subscribe("orders").await.unwrap();

    let strategy = Arc::new(CoordinatorStrategy::new(
        store.clone(),
        descriptor("inst_a"),
        WorkBatchOptions::default(),
    ));
    strategy.queue_outbox_message(new_outbox_message("msg_01", "s1", "orders"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = OutboxPublisherWorker::new(
        strategy.clone(),
        transport.clone(),
        OutboxWorkerConfig::default(),
    );
    let task = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let delivery = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("delivery within timeout")
        .expect("subscription alive");
    assert_eq!(delivery.destination, "orders");
    assert_eq!(delivery.envelope_type, "OrderPlaced");
    assert_eq!(delivery.stream_id, "s1");

    let id = MessageId::from_string("msg_01".to_string());
    let published = wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        let id = id.clone();
        async move {
            store
                .outbox_row(&id)
                .await
                .is_some_and(|row| row.status_flags.contains(StatusFlags::PUBLISHED))
        }
    })
    .await;
    assert!(published, "row must carry the PUBLISHED bit");

    let row = store.outbox_row(&id).await.unwrap();
    assert!(row.published_at.is_some());
    assert!(row.instance_id.is_none() && row.lease_expiry.is_none());

    // published rows are never handed out again
    let reply = store
        .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_a")))
        .await
        .unwrap();
    assert!(reply.outbox.is_empty());

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
}
