//! Event store records
//!
//! The append-only per-stream log backing read-model updates. `sequence`
//! starts at 0 and is assigned by the store at append time; `event_id` is
//! the envelope's message id, so event ids inherit ULID time-ordering and
//! support range reads between two ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, StreamId};

/// Sequence value reported for an empty stream
pub const EMPTY_STREAM_SEQUENCE: i64 = -1;

/// One immutable event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub stream_id: StreamId,
    pub sequence: i64,
    pub event_id: MessageId,
    pub envelope: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
