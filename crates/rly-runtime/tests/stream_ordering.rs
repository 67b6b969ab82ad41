//! Cross-instance stream ordering: while an older row of a stream is held
//! by another alive instance, nothing later in that stream is handed out —
//! even to the partition's rightful owner after a rebalance.

mod common;

use chrono::{Duration as ChronoDuration, Utc};

use common::descriptor;
use rly_adapters::InMemoryWorkStore;
use rly_domain::{
    InstanceId, MessageId, OutboxMessage, ServiceInstance, StatusFlags, StreamId, WorkBatchRequest,
};
use rly_ports::WorkCoordinator;

fn seeded_row(
    id: &str,
    created_offset_secs: i64,
    owner: Option<(&str, i64)>,
) -> OutboxMessage {
    let now = Utc::now();
    let (instance_id, lease_expiry) = match owner {
        Some((owner_id, lease_offset)) => (
            Some(InstanceId::from_string(owner_id.to_string())),
            Some(now + ChronoDuration::seconds(lease_offset)),
        ),
        None => (None, None),
    };
    OutboxMessage {
        message_id: MessageId::from_string(id.to_string()),
        destination: "orders".to_string(),
        envelope_type: "OrderPlaced".to_string(),
        envelope: serde_json::json!({}),
        metadata: serde_json::Value::Null,
        stream_id: StreamId::from_string("stream_s".to_string()),
        // partition 1 belongs to inst_b (rank 1) among two alive instances
        partition_number: 1,
        status_flags: StatusFlags::STORED,
        attempts: 0,
        instance_id,
        lease_expiry,
        created_at: now + ChronoDuration::seconds(created_offset_secs),
        published_at: None,
        processed_at: None,
        error: None,
    }
}

fn alive_instance(id: &str) -> ServiceInstance {
    let now = Utc::now();
    ServiceInstance {
        instance_id: InstanceId::from_string(id.to_string()),
        service_name: "billing".to_string(),
        host_name: "host-1".to_string(),
        process_id: 7,
        started_at: now,
        last_heartbeat_at: now,
        metadata: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn held_stream_head_excludes_later_rows_from_other_instances() {
    let store = InMemoryWorkStore::new();
    store.seed_instance(alive_instance("inst_a")).await;
    store.seed_instance(alive_instance("inst_b")).await;

    // inst_a still holds the earliest row (pre-rebalance lease); the rest
    // of the stream is unleased on inst_b's partition
    store.seed_outbox(seeded_row("msg_01", 0, Some(("inst_a", 300)))).await;
    store.seed_outbox(seeded_row("msg_02", 1, None)).await;
    store.seed_outbox(seeded_row("msg_03", 2, None)).await;
    store.seed_outbox(seeded_row("msg_04", 3, None)).await;

    let reply = store
        .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_b")))
        .await
        .unwrap();
    assert!(
        reply.outbox.is_empty(),
        "later rows of a held stream must be excluded, got {:?}",
        reply.outbox.iter().map(|w| w.message_id.as_str()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn expired_head_releases_the_whole_stream_in_order() {
    let store = InMemoryWorkStore::new();
    store.seed_instance(alive_instance("inst_a")).await;
    store.seed_instance(alive_instance("inst_b")).await;

    // the old owner's lease has expired
    store.seed_outbox(seeded_row("msg_01", 0, Some(("inst_a", -60)))).await;
    store.seed_outbox(seeded_row("msg_02", 1, None)).await;
    store.seed_outbox(seeded_row("msg_03", 2, None)).await;
    store.seed_outbox(seeded_row("msg_04", 3, None)).await;

    let reply = store
        .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_b")))
        .await
        .unwrap();
    let ids: Vec<&str> = reply.outbox.iter().map(|w| w.message_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["msg_01", "msg_02", "msg_03", "msg_04"],
        "earliest-remaining first, in created order"
    );
}
