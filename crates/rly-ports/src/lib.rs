//! Relay Port Traits
//!
//! This crate defines the interfaces that tie the runtime together without
//! back-pointers between components:
//! - `WorkCoordinator` — the single-call durable store contract
//! - `Transport` / `Subscription` — the messaging capability contract
//! - `EventStore` — append-only per-stream log
//! - `Dispatcher` — opaque local handler registry
//! - `Clock` — deterministic time source
//!
//! Workers depend only on these traits; adapters implement them. No
//! component holds a concrete reference to another.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use rly_domain::{
    Envelope, EventRecord, MessageId, MessageMetadata, StreamId, WorkBatchReply, WorkBatchRequest,
    WorkError,
};

// ============================================================================
// Work Coordinator
// ============================================================================

/// The durable store's single-call contract
///
/// One `process_work_batch` invocation applies reported results, stores new
/// messages, recovers orphaned work, and returns the next batch — all in one
/// atomic round-trip.
pub trait WorkCoordinator: Send + Sync {
    /// Apply a work batch and claim the next set of rows
    fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> impl Future<Output = Result<WorkBatchReply, CoordinatorError>> + Send;

    /// Check the dedup table for a previously seen message id
    fn is_duplicate(
        &self,
        message_id: &MessageId,
    ) -> impl Future<Output = Result<bool, CoordinatorError>> + Send;
}

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

// ============================================================================
// Transport
// ============================================================================

/// Capability bitmap declared by every transport adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportCapabilities(u32);

impl TransportCapabilities {
    pub const PUBLISH_SUBSCRIBE: TransportCapabilities = TransportCapabilities(1);
    pub const RELIABLE: TransportCapabilities = TransportCapabilities(2);
    pub const REQUEST_RESPONSE: TransportCapabilities = TransportCapabilities(4);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn supports(self, other: TransportCapabilities) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: TransportCapabilities) -> Self {
        Self(self.0 | other.0)
    }
}

/// A message handed over by the transport
///
/// `envelope_type` and `stream_id` travel out-of-band on transport metadata
/// (headers); the payload stays an opaque serialized envelope.
#[derive(Debug, Clone)]
pub struct TransportDelivery {
    pub destination: String,
    /// Type discriminator for deserialization
    pub envelope_type: String,
    /// Ordering key of the originating stream
    pub stream_id: String,
    /// Serialized envelope bytes
    pub payload: Vec<u8>,
}

/// Messaging capability contract consumed by the workers
pub trait Transport: Send + Sync {
    /// Capability bitmap of this adapter
    fn capabilities(&self) -> TransportCapabilities;

    /// Whether the adapter can currently accept publishes
    fn ready(&self) -> impl Future<Output = bool> + Send;

    /// Fire-and-forget delivery; failure surfaces as an error
    fn publish(
        &self,
        destination: &str,
        envelope_type: &str,
        stream_id: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to a destination
    fn subscribe(
        &self,
        destination: &str,
    ) -> impl Future<Output = Result<Box<dyn Subscription>, TransportError>> + Send;
}

/// Outcome the consumer reports back to the transport for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Done with the message; never redeliver
    Accept,
    /// Not durably recorded yet; redeliver later
    Retry,
    /// Poison; never redeliver
    Reject,
}

/// A live subscription
///
/// `pause` stops delivery without cancelling the worker; `resume` restarts
/// it; both are idempotent. `dispose` ends the subscription.
///
/// A delivery returned by `next` stays in flight on the transport until the
/// consumer settles it. Settling only after the message is durably recorded
/// is what keeps delivery at-least-once across a crash.
pub trait Subscription: Send {
    /// Receive the next delivery; `None` once the subscription ends
    fn next(&mut self)
        -> Pin<Box<dyn Future<Output = Option<TransportDelivery>> + Send + '_>>;

    /// Settle the delivery most recently returned by `next`. A delivery
    /// left unsettled when `next` is called again is treated as `Retry`.
    fn settle(
        &mut self,
        disposition: AckDisposition,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Handle for pausing/resuming delivery from outside the consumer task
    fn pause_handle(&self) -> PauseHandle;

    /// End the subscription; subsequent `next` calls return `None`.
    /// An unsettled delivery is left for the transport to redeliver.
    fn dispose(&mut self);
}

/// Shared pause/resume switch for a subscription
#[derive(Debug, Clone, Default)]
pub struct PauseHandle {
    paused: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl PauseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Suspend the caller while paused; returns immediately when not
    pub async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::SeqCst) {
            let notified = self.notify.notified();
            if !self.paused.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    #[error("Publish error: {message}")]
    PublishError { message: String },

    #[error("Subscribe error: {message}")]
    SubscribeError { message: String },

    #[error("Transport not ready")]
    NotReady,
}

// ============================================================================
// Event Store
// ============================================================================

/// Append-only per-stream log with monotonic sequence numbers
pub trait EventStore: Send + Sync {
    /// Append one envelope; the store assigns the next sequence (from 0)
    fn append(
        &self,
        stream_id: &StreamId,
        envelope: &Envelope,
    ) -> impl Future<Output = Result<i64, EventStoreError>> + Send;

    /// Read events ascending by sequence, starting at `from_sequence`
    fn read(
        &self,
        stream_id: &StreamId,
        from_sequence: i64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<EventRecord>, EventStoreError>> + Send;

    /// Highest sequence stored for the stream, or -1 when empty
    fn last_sequence(
        &self,
        stream_id: &StreamId,
    ) -> impl Future<Output = Result<i64, EventStoreError>> + Send;

    /// Events strictly after `after_event_id` (or from the start when
    /// `None`) up to and including `up_to_event_id`, ordered by event id
    fn events_between(
        &self,
        stream_id: &StreamId,
        after_event_id: Option<&MessageId>,
        up_to_event_id: &MessageId,
    ) -> impl Future<Output = Result<Vec<EventRecord>, EventStoreError>> + Send;
}

/// Event store errors
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

// ============================================================================
// Dispatcher
// ============================================================================

/// One inbox delivery handed to the local handler registry
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub handler_name: String,
    pub envelope_type: String,
    pub envelope: Envelope,
    pub metadata: MessageMetadata,
    pub stream_id: StreamId,
}

/// Receipt returned for every handled delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub handled_by: String,
    pub completed_at: DateTime<Utc>,
    /// Handler's primary result value, opaque to the runtime
    pub result: serde_json::Value,
}

/// An event produced by a handler, destined for the outbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub destination: String,
    pub envelope_type: String,
    pub payload: serde_json::Value,
    pub stream_id: StreamId,
}

/// Handler result: the receipt plus any events to cascade
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub receipt: DeliveryReceipt,
    pub events: Vec<OutboundEvent>,
}

/// Opaque handler registry consumed by the inbox worker
pub trait Dispatcher: Send + Sync {
    /// The registered handler name for a type tag, if any
    fn handler_name_for(&self, envelope_type: &str) -> Option<String>;

    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> impl Future<Output = Result<DispatchOutcome, WorkError>> + Send;
}

// ============================================================================
// Clock
// ============================================================================

/// Clock port for deterministic time handling
pub trait Clock: Send + Sync {
    /// Get the current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
