//! In-memory durable store
//!
//! Implements the full `process_work_batch` contract over process-local
//! state. Used as the embedded mode for single-process deployments and as
//! the store under the integration tests; the semantics are the reference
//! the PostgreSQL adapter mirrors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use rly_domain::{
    cascade_release_targets, completion_flags, failure_flags, partition_for_stream, plan_claims,
    Envelope, EventRecord, InboxMessage, InboxWork, InstanceId, MessageCompletion, MessageId,
    OutboxMessage, OutboxWork, RowSnapshot, ServiceInstance, StatusFlags, StreamId,
    WorkBatchReply, WorkBatchRequest, EMPTY_STREAM_SEQUENCE,
};
use rly_ports::{Clock, CoordinatorError, EventStore, EventStoreError, SystemClock, WorkCoordinator};

#[derive(Default)]
struct StoreState {
    outbox: HashMap<MessageId, OutboxMessage>,
    inbox: HashMap<MessageId, InboxMessage>,
    instances: HashMap<InstanceId, ServiceInstance>,
    dedup: HashMap<MessageId, DateTime<Utc>>,
    streams: HashMap<StreamId, Vec<EventRecord>>,
    sequences: HashMap<String, i64>,
}

/// In-memory work store
pub struct InMemoryWorkStore {
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
}

impl Default for InMemoryWorkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Allocate the next value of a named monotone counter, starting at 0
    pub async fn allocate_sequence(&self, name: &str) -> i64 {
        let mut state = self.state.lock().await;
        let counter = state.sequences.entry(name.to_string()).or_insert(-1);
        *counter += 1;
        *counter
    }

    // ------------------------------------------------------------------
    // Embedded-mode accessors (also the seam the tests drive)
    // ------------------------------------------------------------------

    pub async fn seed_outbox(&self, row: OutboxMessage) {
        let mut state = self.state.lock().await;
        state.outbox.insert(row.message_id.clone(), row);
    }

    pub async fn seed_inbox(&self, row: InboxMessage) {
        let mut state = self.state.lock().await;
        state.inbox.insert(row.message_id.clone(), row);
    }

    pub async fn seed_instance(&self, instance: ServiceInstance) {
        let mut state = self.state.lock().await;
        state.instances.insert(instance.instance_id.clone(), instance);
    }

    pub async fn outbox_row(&self, message_id: &MessageId) -> Option<OutboxMessage> {
        self.state.lock().await.outbox.get(message_id).cloned()
    }

    pub async fn inbox_row(&self, message_id: &MessageId) -> Option<InboxMessage> {
        self.state.lock().await.inbox.get(message_id).cloned()
    }

    pub async fn instance(&self, instance_id: &InstanceId) -> Option<ServiceInstance> {
        self.state.lock().await.instances.get(instance_id).cloned()
    }

    pub async fn outbox_len(&self) -> usize {
        self.state.lock().await.outbox.len()
    }

    pub async fn inbox_len(&self) -> usize {
        self.state.lock().await.inbox.len()
    }
}

fn outbox_snapshot(row: &OutboxMessage) -> RowSnapshot {
    RowSnapshot {
        message_id: row.message_id.clone(),
        stream_id: row.stream_id.clone(),
        partition_number: row.partition_number,
        status_flags: row.status_flags,
        attempts: row.attempts,
        instance_id: row.instance_id.clone(),
        lease_expiry: row.lease_expiry,
        created_at: row.created_at,
    }
}

fn inbox_snapshot(row: &InboxMessage) -> RowSnapshot {
    RowSnapshot {
        message_id: row.message_id.clone(),
        stream_id: row.stream_id.clone(),
        partition_number: row.partition_number,
        status_flags: row.status_flags,
        attempts: row.attempts,
        instance_id: row.instance_id.clone(),
        lease_expiry: row.lease_expiry,
        created_at: row.created_at,
    }
}

impl WorkCoordinator for InMemoryWorkStore {
    #[instrument(skip(self, request), fields(instance_id = %request.instance.instance_id))]
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> Result<WorkBatchReply, CoordinatorError> {
        let now = self.clock.now();
        let options = request.options;
        let me = request.instance.instance_id.clone();
        let lease = Duration::seconds(i64::from(options.lease_seconds));

        let mut state = self.state.lock().await;

        // 1. Heartbeat upsert
        use std::collections::hash_map::Entry;
        match state.instances.entry(me.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.last_heartbeat_at = now;
                existing.metadata = request.instance.metadata.clone();
                existing.host_name = request.instance.host_name.clone();
                existing.process_id = request.instance.process_id;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ServiceInstance {
                    instance_id: me.clone(),
                    service_name: request.instance.service_name.clone(),
                    host_name: request.instance.host_name.clone(),
                    process_id: request.instance.process_id,
                    started_at: now,
                    last_heartbeat_at: now,
                    metadata: request.instance.metadata.clone(),
                });
            }
        }

        // 2. Apply completions
        for completion in &request.outbox_completions {
            apply_outbox_completion(&mut state, completion, now);
        }
        for completion in &request.inbox_completions {
            apply_inbox_completion(&mut state, completion, now);
        }

        // 3. Apply failures
        let mut failed_outbox: Vec<(StreamId, DateTime<Utc>, MessageId)> = Vec::new();
        for failure in &request.outbox_failures {
            if let Some(row) = state.outbox.get_mut(&failure.message_id) {
                row.attempts += 1;
                row.status_flags = failure_flags(
                    row.status_flags,
                    failure.completed_status,
                    row.attempts,
                    options.max_attempts,
                );
                row.error = Some(failure.error.clone());
                row.instance_id = None;
                row.lease_expiry = None;
                failed_outbox.push((row.stream_id.clone(), row.created_at, row.message_id.clone()));
            }
        }
        let mut failed_inbox: Vec<(StreamId, DateTime<Utc>, MessageId)> = Vec::new();
        for failure in &request.inbox_failures {
            if let Some(row) = state.inbox.get_mut(&failure.message_id) {
                row.attempts += 1;
                row.status_flags = failure_flags(
                    row.status_flags,
                    failure.completed_status,
                    row.attempts,
                    options.max_attempts,
                );
                row.error = Some(failure.error.clone());
                row.instance_id = None;
                row.lease_expiry = None;
                failed_inbox.push((row.stream_id.clone(), row.created_at, row.message_id.clone()));
            }
        }

        // 4. Stream failure cascade
        for (stream_id, created_at, message_id) in &failed_outbox {
            let snapshots: Vec<RowSnapshot> = state.outbox.values().map(outbox_snapshot).collect();
            for target in cascade_release_targets(&snapshots, stream_id, *created_at, message_id) {
                if let Some(row) = state.outbox.get_mut(&target) {
                    row.instance_id = None;
                    row.lease_expiry = None;
                }
            }
        }
        for (stream_id, created_at, message_id) in &failed_inbox {
            let snapshots: Vec<RowSnapshot> = state.inbox.values().map(inbox_snapshot).collect();
            for target in cascade_release_targets(&snapshots, stream_id, *created_at, message_id) {
                if let Some(row) = state.inbox.get_mut(&target) {
                    row.instance_id = None;
                    row.lease_expiry = None;
                }
            }
        }

        // 5. Insert new messages
        for new in &request.new_outbox_messages {
            if state.outbox.contains_key(&new.message_id) {
                continue;
            }
            let partition_number = partition_for_stream(&new.stream_id, options.partition_count);
            state.outbox.insert(
                new.message_id.clone(),
                OutboxMessage {
                    message_id: new.message_id.clone(),
                    destination: new.destination.clone(),
                    envelope_type: new.envelope_type.clone(),
                    envelope: new.envelope.clone(),
                    metadata: new.metadata.clone(),
                    stream_id: new.stream_id.clone(),
                    partition_number,
                    status_flags: StatusFlags::STORED,
                    attempts: 0,
                    instance_id: None,
                    lease_expiry: None,
                    created_at: now,
                    published_at: None,
                    processed_at: None,
                    error: None,
                },
            );
        }
        for new in &request.new_inbox_messages {
            // Dedup is written with the row; a second delivery of the same
            // message id is dropped here, before any handler sees it.
            if state.dedup.contains_key(&new.message_id)
                || state.inbox.contains_key(&new.message_id)
            {
                continue;
            }
            state.dedup.insert(new.message_id.clone(), now);
            let partition_number = partition_for_stream(&new.stream_id, options.partition_count);
            state.inbox.insert(
                new.message_id.clone(),
                InboxMessage {
                    message_id: new.message_id.clone(),
                    handler_name: new.handler_name.clone(),
                    envelope_type: new.envelope_type.clone(),
                    envelope: new.envelope.clone(),
                    metadata: new.metadata.clone(),
                    stream_id: new.stream_id.clone(),
                    partition_number,
                    status_flags: StatusFlags::STORED,
                    attempts: 0,
                    instance_id: None,
                    lease_expiry: None,
                    created_at: now,
                    published_at: None,
                    processed_at: None,
                    error: None,
                },
            );
        }

        // 6. Renew leases
        for message_id in &request.renew_outbox_lease_ids {
            if let Some(row) = state.outbox.get_mut(message_id) {
                if row.instance_id.as_ref() == Some(&me) {
                    row.lease_expiry = Some(now + lease);
                }
            }
        }
        for message_id in &request.renew_inbox_lease_ids {
            if let Some(row) = state.inbox.get_mut(message_id) {
                if row.instance_id.as_ref() == Some(&me) {
                    row.lease_expiry = Some(now + lease);
                }
            }
        }

        // 7. Claim work
        let alive: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|i| {
                i.service_name == request.instance.service_name
                    && i.is_alive(now, options.stale_threshold_seconds)
            })
            .map(|i| i.instance_id.clone())
            .collect();

        let outbox_snapshots: Vec<RowSnapshot> =
            state.outbox.values().map(outbox_snapshot).collect();
        let outbox_claims = plan_claims(
            &outbox_snapshots,
            &me,
            &alive,
            now,
            options.batch_size as usize,
        );
        let inbox_snapshots: Vec<RowSnapshot> = state.inbox.values().map(inbox_snapshot).collect();
        let inbox_claims = plan_claims(
            &inbox_snapshots,
            &me,
            &alive,
            now,
            options.batch_size as usize,
        );

        // 8. Lease and return the claimed rows in batch order
        let mut reply = WorkBatchReply::default();
        for message_id in &outbox_claims {
            if let Some(row) = state.outbox.get_mut(message_id) {
                row.instance_id = Some(me.clone());
                row.lease_expiry = Some(now + lease);
                reply.outbox.push(OutboxWork {
                    message_id: row.message_id.clone(),
                    destination: row.destination.clone(),
                    envelope_type: row.envelope_type.clone(),
                    envelope: row.envelope.clone(),
                    metadata: row.metadata.clone(),
                    stream_id: row.stream_id.clone(),
                    partition_number: row.partition_number,
                    attempts: row.attempts,
                    created_at: row.created_at,
                });
            }
        }
        for message_id in &inbox_claims {
            if let Some(row) = state.inbox.get_mut(message_id) {
                row.instance_id = Some(me.clone());
                row.lease_expiry = Some(now + lease);
                reply.inbox.push(InboxWork {
                    message_id: row.message_id.clone(),
                    handler_name: row.handler_name.clone(),
                    envelope_type: row.envelope_type.clone(),
                    envelope: row.envelope.clone(),
                    metadata: row.metadata.clone(),
                    stream_id: row.stream_id.clone(),
                    partition_number: row.partition_number,
                    attempts: row.attempts,
                    created_at: row.created_at,
                });
            }
        }

        debug!(
            outbox_claimed = reply.outbox.len(),
            inbox_claimed = reply.inbox.len(),
            "Work batch processed"
        );
        Ok(reply)
    }

    async fn is_duplicate(&self, message_id: &MessageId) -> Result<bool, CoordinatorError> {
        Ok(self.state.lock().await.dedup.contains_key(message_id))
    }
}

fn apply_outbox_completion(state: &mut StoreState, completion: &MessageCompletion, now: DateTime<Utc>) {
    if let Some(row) = state.outbox.get_mut(&completion.message_id) {
        if completion.status.is_none() {
            // Release without progress: lease cleared, flags untouched
            row.instance_id = None;
            row.lease_expiry = None;
            return;
        }
        row.status_flags = completion_flags(row.status_flags, completion.status);
        // same condition as the SQL adapter: first PUBLISHED report stamps
        if completion.status.contains(StatusFlags::PUBLISHED) && row.published_at.is_none() {
            row.published_at = Some(now);
        }
        row.instance_id = None;
        row.lease_expiry = None;
    }
}

fn apply_inbox_completion(state: &mut StoreState, completion: &MessageCompletion, now: DateTime<Utc>) {
    let mut fully_completed = false;
    if let Some(row) = state.inbox.get_mut(&completion.message_id) {
        if completion.status.is_none() {
            row.instance_id = None;
            row.lease_expiry = None;
            return;
        }
        row.status_flags = completion_flags(row.status_flags, completion.status);
        // same condition as the SQL adapter: processed_at is stamped once
        if row.processed_at.is_none() {
            row.processed_at = Some(now);
        }
        row.instance_id = None;
        row.lease_expiry = None;
        fully_completed = row.status_flags.contains(StatusFlags::FULLY_COMPLETED);
    }
    if fully_completed {
        state.inbox.remove(&completion.message_id);
    }
}

impl EventStore for InMemoryWorkStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        envelope: &Envelope,
    ) -> Result<i64, EventStoreError> {
        let now = self.clock.now();
        let envelope_value =
            serde_json::to_value(envelope).map_err(|e| EventStoreError::SerializationError {
                message: e.to_string(),
            })?;

        let mut state = self.state.lock().await;
        let events = state.streams.entry(stream_id.clone()).or_default();
        let sequence = events.len() as i64;
        events.push(EventRecord {
            stream_id: stream_id.clone(),
            sequence,
            event_id: envelope.message_id.clone(),
            envelope: envelope_value,
            recorded_at: now,
        });
        Ok(sequence)
    }

    async fn read(
        &self,
        stream_id: &StreamId,
        from_sequence: i64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence >= from_sequence)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_sequence(&self, stream_id: &StreamId) -> Result<i64, EventStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream_id)
            .and_then(|events| events.last().map(|e| e.sequence))
            .unwrap_or(EMPTY_STREAM_SEQUENCE))
    }

    async fn events_between(
        &self,
        stream_id: &StreamId,
        after_event_id: Option<&MessageId>,
        up_to_event_id: &MessageId,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let state = self.state.lock().await;
        let mut selected: Vec<EventRecord> = state
            .streams
            .get(stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| {
                        after_event_id.map_or(true, |after| &e.event_id > after)
                            && &e.event_id <= up_to_event_id
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        selected.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rly_domain::{
        InstanceDescriptor, MessageFailure, NewInboxMessage, NewOutboxMessage, WorkBatchOptions,
    };

    /// Options that report without claiming, so intermediate row state is
    /// observable
    fn report_only() -> WorkBatchOptions {
        WorkBatchOptions {
            batch_size: 0,
            ..WorkBatchOptions::default()
        }
    }

    fn descriptor(id: &str) -> InstanceDescriptor {
        InstanceDescriptor {
            instance_id: InstanceId::from_string(id.to_string()),
            service_name: "billing".to_string(),
            host_name: "host-1".to_string(),
            process_id: 7,
            metadata: serde_json::json!({"version": "0.1.0"}),
        }
    }

    fn new_outbox(id: &str, stream: &str) -> NewOutboxMessage {
        NewOutboxMessage {
            message_id: MessageId::from_string(id.to_string()),
            destination: "orders".to_string(),
            envelope_type: "OrderPlaced".to_string(),
            envelope: serde_json::json!({"MessageId": id, "Hops": [], "Payload": {}}),
            metadata: serde_json::Value::Null,
            stream_id: StreamId::from_string(stream.to_string()),
        }
    }

    #[tokio::test]
    async fn test_empty_call_is_pure_heartbeat() {
        let store = InMemoryWorkStore::new();
        let request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        let reply = store.process_work_batch(request).await.unwrap();

        assert!(reply.is_empty());
        let instance = store
            .instance(&InstanceId::from_string("inst_a".to_string()))
            .await
            .unwrap();
        assert_eq!(instance.service_name, "billing");
        assert_eq!(store.outbox_len().await, 0);
        assert_eq!(store.inbox_len().await, 0);
    }

    #[tokio::test]
    async fn test_store_then_claim_then_publish() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.new_outbox_messages = vec![new_outbox("msg_01", "s1")];
        let reply = store.process_work_batch(request).await.unwrap();
        assert_eq!(reply.outbox.len(), 1);
        assert_eq!(reply.outbox[0].message_id.as_str(), "msg_01");

        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert_eq!(row.instance_id.as_ref().unwrap().as_str(), "inst_a");
        assert!(row.lease_expiry.is_some());

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.outbox_completions = vec![MessageCompletion::new(
            MessageId::from_string("msg_01".to_string()),
            StatusFlags::PUBLISHED,
        )];
        let reply = store.process_work_batch(request).await.unwrap();
        assert!(reply.outbox.is_empty(), "published rows are not re-claimed");

        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert!(row.status_flags.contains(StatusFlags::PUBLISHED));
        assert!(row.published_at.is_some());
        assert!(row.processed_at.is_none(), "outbox completions never stamp processed_at");
        assert!(row.instance_id.is_none() && row.lease_expiry.is_none());
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.new_outbox_messages = vec![new_outbox("msg_01", "s1")];
        store.process_work_batch(request).await.unwrap();

        for _ in 0..2 {
            let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
            request.outbox_completions = vec![MessageCompletion::new(
                MessageId::from_string("msg_01".to_string()),
                StatusFlags::PUBLISHED,
            )];
            store.process_work_batch(request).await.unwrap();
        }

        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert_eq!(
            row.status_flags,
            StatusFlags::STORED | StatusFlags::PUBLISHED
        );
    }

    #[tokio::test]
    async fn test_release_without_progress_keeps_flags() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.new_outbox_messages = vec![new_outbox("msg_01", "s1")];
        let reply = store.process_work_batch(request).await.unwrap();
        assert_eq!(reply.outbox.len(), 1);

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.options = report_only();
        request.outbox_completions = vec![MessageCompletion::release(MessageId::from_string(
            "msg_01".to_string(),
        ))];
        store.process_work_batch(request).await.unwrap();

        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert_eq!(row.status_flags, StatusFlags::STORED);
        assert!(row.instance_id.is_none());
        assert!(row.lease_expiry.is_none());
    }

    #[tokio::test]
    async fn test_failure_increments_attempts_and_releases() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.new_outbox_messages = vec![new_outbox("msg_01", "s1")];
        store.process_work_batch(request).await.unwrap();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.options = report_only();
        request.outbox_failures = vec![MessageFailure::new(
            MessageId::from_string("msg_01".to_string()),
            StatusFlags::STORED,
            "broker unreachable",
        )];
        store.process_work_batch(request).await.unwrap();

        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert_eq!(row.attempts, 1);
        assert!(row.status_flags.contains(StatusFlags::FAILED));
        assert!(row.status_flags.contains(StatusFlags::RETRY));
        assert_eq!(row.error.as_deref(), Some("broker unreachable"));
        assert!(row.instance_id.is_none());
    }

    #[tokio::test]
    async fn test_max_attempts_parks_outbox_row() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.options = WorkBatchOptions {
            max_attempts: 2,
            ..WorkBatchOptions::default()
        };
        request.new_outbox_messages = vec![new_outbox("msg_01", "s1")];
        store.process_work_batch(request).await.unwrap();

        for _ in 0..2 {
            let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
            request.options = WorkBatchOptions {
                max_attempts: 2,
                ..WorkBatchOptions::default()
            };
            request.outbox_failures = vec![MessageFailure::new(
                MessageId::from_string("msg_01".to_string()),
                StatusFlags::STORED,
                "err",
            )];
            store.process_work_batch(request).await.unwrap();
        }

        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert_eq!(row.attempts, 2);
        assert!(row.status_flags.contains(StatusFlags::FAILED));
        assert!(!row.status_flags.contains(StatusFlags::RETRY));

        // parked rows are never claimed again
        let reply = store
            .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_a")))
            .await
            .unwrap();
        assert!(reply.outbox.is_empty());
    }

    #[tokio::test]
    async fn test_inbox_fully_completed_row_is_deleted() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.new_inbox_messages = vec![NewInboxMessage {
            message_id: MessageId::from_string("msg_01".to_string()),
            handler_name: "order-handler".to_string(),
            envelope_type: "OrderPlaced".to_string(),
            envelope: serde_json::json!({}),
            metadata: serde_json::Value::Null,
            stream_id: StreamId::from_string("s1".to_string()),
        }];
        store.process_work_batch(request).await.unwrap();
        assert_eq!(store.inbox_len().await, 1);

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.inbox_completions = vec![MessageCompletion::new(
            MessageId::from_string("msg_01".to_string()),
            StatusFlags::FULLY_COMPLETED,
        )];
        store.process_work_batch(request).await.unwrap();

        assert_eq!(store.inbox_len().await, 0);
        // dedup survives deletion
        assert!(store
            .is_duplicate(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_partial_inbox_completion_stamps_processed_at_only() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.new_inbox_messages = vec![NewInboxMessage {
            message_id: MessageId::from_string("msg_01".to_string()),
            handler_name: "order-handler".to_string(),
            envelope_type: "OrderPlaced".to_string(),
            envelope: serde_json::json!({}),
            metadata: serde_json::Value::Null,
            stream_id: StreamId::from_string("s1".to_string()),
        }];
        store.process_work_batch(request).await.unwrap();

        // short of FULLY_COMPLETED, so the row survives for inspection
        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.options = report_only();
        request.inbox_completions = vec![MessageCompletion::new(
            MessageId::from_string("msg_01".to_string()),
            StatusFlags::STORED | StatusFlags::EVENT_STORED,
        )];
        store.process_work_batch(request).await.unwrap();

        let row = store
            .inbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert!(row.status_flags.contains(StatusFlags::EVENT_STORED));
        assert!(row.processed_at.is_some());
        assert!(row.published_at.is_none(), "inbox completions never stamp published_at");
    }

    #[tokio::test]
    async fn test_duplicate_inbox_insert_is_dropped() {
        let store = InMemoryWorkStore::new();

        for _ in 0..2 {
            let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
            request.new_inbox_messages = vec![NewInboxMessage {
                message_id: MessageId::from_string("msg_01".to_string()),
                handler_name: "order-handler".to_string(),
                envelope_type: "OrderPlaced".to_string(),
                envelope: serde_json::json!({}),
                metadata: serde_json::Value::Null,
                stream_id: StreamId::from_string("s1".to_string()),
            }];
            store.process_work_batch(request).await.unwrap();
        }

        assert_eq!(store.inbox_len().await, 1);
    }

    #[tokio::test]
    async fn test_lease_renewal_extends_own_lease_only() {
        let store = InMemoryWorkStore::new();

        let mut request = WorkBatchRequest::heartbeat(descriptor("inst_a"));
        request.new_outbox_messages = vec![new_outbox("msg_01", "s1")];
        let reply = store.process_work_batch(request).await.unwrap();
        assert_eq!(reply.outbox.len(), 1);
        let first_expiry = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap()
            .lease_expiry
            .unwrap();

        // another instance renewing someone else's lease is a no-op
        let request = WorkBatchRequest::renewal(
            descriptor("inst_b"),
            vec![MessageId::from_string("msg_01".to_string())],
            Vec::new(),
            WorkBatchOptions::default(),
        );
        store.process_work_batch(request).await.unwrap();
        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert_eq!(row.instance_id.as_ref().unwrap().as_str(), "inst_a");

        let request = WorkBatchRequest::renewal(
            descriptor("inst_a"),
            vec![MessageId::from_string("msg_01".to_string())],
            Vec::new(),
            WorkBatchOptions::default(),
        );
        store.process_work_batch(request).await.unwrap();
        let row = store
            .outbox_row(&MessageId::from_string("msg_01".to_string()))
            .await
            .unwrap();
        assert!(row.lease_expiry.unwrap() >= first_expiry);
    }

    #[tokio::test]
    async fn test_event_store_sequences() {
        let store = InMemoryWorkStore::new();
        let stream = StreamId::from_string("ledger-1".to_string());

        assert_eq!(store.last_sequence(&stream).await.unwrap(), -1);

        let first = Envelope::new(serde_json::json!({"n": 1}));
        let second = Envelope::new(serde_json::json!({"n": 2}));
        assert_eq!(store.append(&stream, &first).await.unwrap(), 0);
        assert_eq!(store.append(&stream, &second).await.unwrap(), 1);
        assert_eq!(store.last_sequence(&stream).await.unwrap(), 1);

        let events = store.read(&stream, 0, 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].envelope["Payload"]["n"], 1);
        assert_eq!(events[1].envelope["Payload"]["n"], 2);
    }

    #[tokio::test]
    async fn test_events_between_bounds() {
        let store = InMemoryWorkStore::new();
        let stream = StreamId::from_string("ledger-1".to_string());

        let envelopes: Vec<Envelope> = (0..4)
            .map(|i| Envelope::new(serde_json::json!({"n": i})))
            .collect();
        for envelope in &envelopes {
            store.append(&stream, envelope).await.unwrap();
        }

        let events = store
            .events_between(
                &stream,
                Some(&envelopes[0].message_id),
                &envelopes[2].message_id,
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, envelopes[1].message_id);
        assert_eq!(events[1].event_id, envelopes[2].message_id);

        let from_start = store
            .events_between(&stream, None, &envelopes[1].message_id)
            .await
            .unwrap();
        assert_eq!(from_start.len(), 2);
    }

    #[tokio::test]
    async fn test_named_sequences_are_monotone() {
        let store = InMemoryWorkStore::new();
        assert_eq!(store.allocate_sequence("invoice").await, 0);
        assert_eq!(store.allocate_sequence("invoice").await, 1);
        assert_eq!(store.allocate_sequence("shipment").await, 0);
    }
}
