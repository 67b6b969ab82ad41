//! Shared fixtures for the runtime scenario tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use rly_domain::{
    Envelope, InstanceDescriptor, InstanceId, MessageId, NewOutboxMessage, StreamId,
};

pub fn descriptor(id: &str) -> InstanceDescriptor {
    InstanceDescriptor {
        instance_id: InstanceId::from_string(id.to_string()),
        service_name: "billing".to_string(),
        host_name: "host-1".to_string(),
        process_id: 7,
        metadata: serde_json::json!({"version": "test"}),
    }
}

pub fn new_outbox_message(id: &str, stream: &str, destination: &str) -> NewOutboxMessage {
    let envelope = Envelope::with_message_id(
        MessageId::from_string(id.to_string()),
        serde_json::json!({"seq": id}),
    );
    NewOutboxMessage {
        message_id: MessageId::from_string(id.to_string()),
        destination: destination.to_string(),
        envelope_type: "OrderPlaced".to_string(),
        envelope: serde_json::to_value(&envelope).expect("envelope serializes"),
        metadata: serde_json::Value::Null,
        stream_id: StreamId::from_string(stream.to_string()),
    }
}

/// Poll `check` until it returns true or the timeout elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
