//! Orphan recovery: rows leased by a dead instance become claimable once
//! the lease expires, and the dead peer drops out of the modulo assignment.

mod common;

use chrono::{Duration as ChronoDuration, Utc};

use common::descriptor;
use rly_adapters::InMemoryWorkStore;
use rly_domain::{
    InstanceId, MessageId, OutboxMessage, ServiceInstance, StatusFlags, StreamId, WorkBatchRequest,
};
use rly_ports::WorkCoordinator;

#[tokio::test]
async fn expired_lease_of_a_dead_instance_is_reclaimed() {
    let store = InMemoryWorkStore::new();
    let now = Utc::now();

    // instance X stopped heartbeating twenty minutes ago
    store
        .seed_instance(ServiceInstance {
            instance_id: InstanceId::from_string("inst_x".to_string()),
            service_name: "billing".to_string(),
            host_name: "host-9".to_string(),
            process_id: 9,
            started_at: now - ChronoDuration::hours(2),
            last_heartbeat_at: now - ChronoDuration::minutes(20),
            metadata: serde_json::Value::Null,
        })
        .await;

    // its lease ran out ten minutes ago
    store
        .seed_outbox(OutboxMessage {
            message_id: MessageId::from_string("msg_01".to_string()),
            destination: "orders".to_string(),
            envelope_type: "OrderPlaced".to_string(),
            envelope: serde_json::json!({}),
            metadata: serde_json::Value::Null,
            stream_id: StreamId::from_string("stream_s".to_string()),
            partition_number: 3,
            status_flags: StatusFlags::STORED,
            attempts: 1,
            instance_id: Some(InstanceId::from_string("inst_x".to_string())),
            lease_expiry: Some(now - ChronoDuration::minutes(10)),
            created_at: now - ChronoDuration::minutes(15),
            published_at: None,
            processed_at: None,
            error: None,
        })
        .await;

    let reply = store
        .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_y")))
        .await
        .unwrap();

    assert_eq!(reply.outbox.len(), 1);
    assert_eq!(reply.outbox[0].message_id.as_str(), "msg_01");
    assert_eq!(reply.outbox[0].attempts, 1);

    let row = store
        .outbox_row(&MessageId::from_string("msg_01".to_string()))
        .await
        .unwrap();
    assert_eq!(row.instance_id.as_ref().map(|i| i.as_str()), Some("inst_y"));
    assert!(row.lease_expiry.is_some_and(|expiry| expiry > now));
}
