//! Coordinator strategy
//!
//! The per-instance accumulator between handlers/workers and the durable
//! store. All queue operations are in-memory, non-blocking, and
//! thread-safe; `flush` drains everything queued since the last call into a
//! single `process_work_batch` round-trip, so results reported by several
//! handlers commit in one transaction.
//!
//! Claimed work returned by a flush is stashed internally and handed out by
//! queue: the outbox worker pulls with `take_outbox_work`, the inbox worker
//! with `take_inbox_work`, regardless of which of them triggered the flush.

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use rly_domain::{
    InboxWork, InstanceDescriptor, MessageCompletion, MessageFailure, MessageId, NewInboxMessage,
    NewOutboxMessage, OutboxWork, WorkBatchOptions, WorkBatchRequest,
};
use rly_ports::{CoordinatorError, WorkCoordinator};

#[derive(Default)]
struct Pending {
    outbox_completions: Vec<MessageCompletion>,
    outbox_failures: Vec<MessageFailure>,
    inbox_completions: Vec<MessageCompletion>,
    inbox_failures: Vec<MessageFailure>,
    new_outbox_messages: Vec<NewOutboxMessage>,
    new_inbox_messages: Vec<NewInboxMessage>,
    renew_outbox_lease_ids: Vec<MessageId>,
    renew_inbox_lease_ids: Vec<MessageId>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.outbox_completions.is_empty()
            && self.outbox_failures.is_empty()
            && self.inbox_completions.is_empty()
            && self.inbox_failures.is_empty()
            && self.new_outbox_messages.is_empty()
            && self.new_inbox_messages.is_empty()
            && self.renew_outbox_lease_ids.is_empty()
            && self.renew_inbox_lease_ids.is_empty()
    }

    /// Put drained items back at the front after a failed flush
    fn restore(&mut self, drained: Pending) {
        fn prepend<T>(target: &mut Vec<T>, mut front: Vec<T>) {
            front.append(target);
            *target = front;
        }
        prepend(&mut self.outbox_completions, drained.outbox_completions);
        prepend(&mut self.outbox_failures, drained.outbox_failures);
        prepend(&mut self.inbox_completions, drained.inbox_completions);
        prepend(&mut self.inbox_failures, drained.inbox_failures);
        prepend(&mut self.new_outbox_messages, drained.new_outbox_messages);
        prepend(&mut self.new_inbox_messages, drained.new_inbox_messages);
        prepend(&mut self.renew_outbox_lease_ids, drained.renew_outbox_lease_ids);
        prepend(&mut self.renew_inbox_lease_ids, drained.renew_inbox_lease_ids);
    }
}

#[derive(Default)]
struct ClaimedWork {
    outbox: Vec<OutboxWork>,
    inbox: Vec<InboxWork>,
}

/// What one flush accomplished
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOutcome {
    pub outbox_claimed: usize,
    pub inbox_claimed: usize,
}

/// Per-instance work accumulator
pub struct CoordinatorStrategy<C: WorkCoordinator> {
    coordinator: std::sync::Arc<C>,
    instance: InstanceDescriptor,
    options: WorkBatchOptions,
    pending: Mutex<Pending>,
    claimed: Mutex<ClaimedWork>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: WorkCoordinator> CoordinatorStrategy<C> {
    pub fn new(
        coordinator: std::sync::Arc<C>,
        instance: InstanceDescriptor,
        options: WorkBatchOptions,
    ) -> Self {
        Self {
            coordinator,
            instance,
            options,
            pending: Mutex::new(Pending::default()),
            claimed: Mutex::new(ClaimedWork::default()),
        }
    }

    pub fn instance(&self) -> &InstanceDescriptor {
        &self.instance
    }

    pub fn options(&self) -> WorkBatchOptions {
        self.options
    }

    // ------------------------------------------------------------------
    // Queue operations: in-memory, non-blocking
    // ------------------------------------------------------------------

    pub fn queue_outbox_message(&self, message: NewOutboxMessage) {
        locked(&self.pending).new_outbox_messages.push(message);
    }

    pub fn queue_inbox_message(&self, message: NewInboxMessage) {
        locked(&self.pending).new_inbox_messages.push(message);
    }

    pub fn queue_outbox_completion(&self, completion: MessageCompletion) {
        locked(&self.pending).outbox_completions.push(completion);
    }

    pub fn queue_outbox_failure(&self, failure: MessageFailure) {
        locked(&self.pending).outbox_failures.push(failure);
    }

    pub fn queue_inbox_completion(&self, completion: MessageCompletion) {
        locked(&self.pending).inbox_completions.push(completion);
    }

    pub fn queue_inbox_failure(&self, failure: MessageFailure) {
        locked(&self.pending).inbox_failures.push(failure);
    }

    pub fn queue_outbox_lease_renewal(&self, message_id: MessageId) {
        locked(&self.pending).renew_outbox_lease_ids.push(message_id);
    }

    pub fn queue_inbox_lease_renewal(&self, message_id: MessageId) {
        locked(&self.pending).renew_inbox_lease_ids.push(message_id);
    }

    pub fn has_pending(&self) -> bool {
        !locked(&self.pending).is_empty()
    }

    // ------------------------------------------------------------------
    // Flush and claimed-work hand-off
    // ------------------------------------------------------------------

    /// Move the accumulated set to one `process_work_batch` call.
    ///
    /// On failure everything drained is restored, so reported results are
    /// never lost to a transient store error.
    pub async fn flush(&self) -> Result<FlushOutcome, CoordinatorError> {
        let drained = mem::take(&mut *locked(&self.pending));

        let request = WorkBatchRequest {
            instance: self.instance.clone(),
            outbox_completions: drained.outbox_completions.clone(),
            outbox_failures: drained.outbox_failures.clone(),
            inbox_completions: drained.inbox_completions.clone(),
            inbox_failures: drained.inbox_failures.clone(),
            new_outbox_messages: drained.new_outbox_messages.clone(),
            new_inbox_messages: drained.new_inbox_messages.clone(),
            renew_outbox_lease_ids: drained.renew_outbox_lease_ids.clone(),
            renew_inbox_lease_ids: drained.renew_inbox_lease_ids.clone(),
            options: self.options,
        };

        match self.coordinator.process_work_batch(request).await {
            Ok(reply) => {
                let outcome = FlushOutcome {
                    outbox_claimed: reply.outbox.len(),
                    inbox_claimed: reply.inbox.len(),
                };
                if !reply.is_empty() {
                    let mut claimed = locked(&self.claimed);
                    claimed.outbox.extend(reply.outbox);
                    claimed.inbox.extend(reply.inbox);
                }
                Ok(outcome)
            }
            Err(e) => {
                debug!(error = %e, "Flush failed; restoring drained reports");
                locked(&self.pending).restore(drained);
                Err(e)
            }
        }
    }

    /// Drain claimed outbox work stashed by previous flushes
    pub fn take_outbox_work(&self) -> Vec<OutboxWork> {
        mem::take(&mut locked(&self.claimed).outbox)
    }

    /// Drain claimed inbox work stashed by previous flushes
    pub fn take_inbox_work(&self) -> Vec<InboxWork> {
        mem::take(&mut locked(&self.claimed).inbox)
    }

    /// Renew leases immediately, outside the normal flush cycle.
    ///
    /// Used by workers holding messages longer than half the lease window;
    /// claims nothing and reports nothing else.
    pub async fn renew_leases(
        &self,
        outbox_ids: Vec<MessageId>,
        inbox_ids: Vec<MessageId>,
    ) -> Result<(), CoordinatorError> {
        if outbox_ids.is_empty() && inbox_ids.is_empty() {
            return Ok(());
        }
        let request =
            WorkBatchRequest::renewal(self.instance.clone(), outbox_ids, inbox_ids, self.options);
        self.coordinator.process_work_batch(request).await?;
        Ok(())
    }

    /// Dedup lookup pass-through
    pub async fn is_duplicate(&self, message_id: &MessageId) -> Result<bool, CoordinatorError> {
        self.coordinator.is_duplicate(message_id).await
    }
}
