//! Outbox/inbox row model
//!
//! The two queues share one shape; an outbox row names a transport
//! `destination`, an inbox row names a local `handler_name`. Rows are
//! exclusively owned by the instance in `instance_id` until `lease_expiry`
//! passes or the row completes. The lease fields are always paired: both
//! null or both set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flags::StatusFlags;
use crate::ids::{InstanceId, MessageId, StreamId};

/// A durable outbox row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub message_id: MessageId,
    pub destination: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: StreamId,
    pub partition_number: u32,
    pub status_flags: StatusFlags,
    pub attempts: u32,
    pub instance_id: Option<InstanceId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A durable inbox row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub message_id: MessageId,
    pub handler_name: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: StreamId,
    pub partition_number: u32,
    pub status_flags: StatusFlags,
    pub attempts: u32,
    pub instance_id: Option<InstanceId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A new outbox message produced by a handler, before the store stamps it
///
/// `partition_number`, `created_at`, and the initial `STORED` flag are
/// assigned by the coordinator at insert time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    pub message_id: MessageId,
    pub destination: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: StreamId,
}

/// A new inbox message recorded on transport delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInboxMessage {
    pub message_id: MessageId,
    pub handler_name: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: StreamId,
}

/// Claimed outbox work returned by `process_work_batch`
///
/// Batch order (ascending `created_at`, tie-broken by `message_id`) is the
/// stable sequence order; workers must publish same-stream items in the
/// order they appear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxWork {
    pub message_id: MessageId,
    pub destination: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: StreamId,
    pub partition_number: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Claimed inbox work returned by `process_work_batch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxWork {
    pub message_id: MessageId,
    pub handler_name: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: StreamId,
    pub partition_number: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
