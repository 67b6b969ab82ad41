//! Work-batch contract
//!
//! One `process_work_batch` call carries everything an instance has to say
//! since its last call: its heartbeat, reported completions and failures,
//! newly produced messages, lease renewals, and the request for the next
//! batch of work. The store applies all of it in a single transaction and
//! returns the claimed rows.

use serde::{Deserialize, Serialize};

use crate::flags::StatusFlags;
use crate::ids::{InstanceId, MessageId};
use crate::instance::DEFAULT_STALE_THRESHOLD_SECONDS;
use crate::message::{InboxWork, NewInboxMessage, NewOutboxMessage, OutboxWork};
use crate::partition::DEFAULT_PARTITION_COUNT;

/// Default lease duration in seconds
pub const DEFAULT_LEASE_SECONDS: u32 = 300;
/// Default per-queue claim limit
pub const DEFAULT_BATCH_SIZE: u32 = 100;
/// Default attempt cap before a failure becomes terminal
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Tunables applied per call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkBatchOptions {
    pub lease_seconds: u32,
    pub partition_count: u32,
    pub stale_threshold_seconds: u32,
    pub batch_size: u32,
    pub max_attempts: u32,
}

impl Default for WorkBatchOptions {
    fn default() -> Self {
        Self {
            lease_seconds: DEFAULT_LEASE_SECONDS,
            partition_count: DEFAULT_PARTITION_COUNT,
            stale_threshold_seconds: DEFAULT_STALE_THRESHOLD_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Identity of the calling instance, upserted as its heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: u32,
    pub metadata: serde_json::Value,
}

/// A reported completion
///
/// `status` is OR-ed into the row's flags. `StatusFlags::NONE` is the
/// reserved "release without progress" sentinel: only the lease is cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCompletion {
    pub message_id: MessageId,
    pub status: StatusFlags,
}

impl MessageCompletion {
    pub fn new(message_id: MessageId, status: StatusFlags) -> Self {
        Self { message_id, status }
    }

    /// Release the lease without recording progress
    pub fn release(message_id: MessageId) -> Self {
        Self {
            message_id,
            status: StatusFlags::NONE,
        }
    }
}

/// A reported failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFailure {
    pub message_id: MessageId,
    /// Progress made before the failure; OR-ed into the row's flags
    pub completed_status: StatusFlags,
    pub error: String,
}

impl MessageFailure {
    pub fn new(
        message_id: MessageId,
        completed_status: StatusFlags,
        error: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            completed_status,
            error: error.into(),
        }
    }
}

/// Everything one coordinator call carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkBatchRequest {
    pub instance: InstanceDescriptor,
    #[serde(default)]
    pub outbox_completions: Vec<MessageCompletion>,
    #[serde(default)]
    pub outbox_failures: Vec<MessageFailure>,
    #[serde(default)]
    pub inbox_completions: Vec<MessageCompletion>,
    #[serde(default)]
    pub inbox_failures: Vec<MessageFailure>,
    #[serde(default)]
    pub new_outbox_messages: Vec<NewOutboxMessage>,
    #[serde(default)]
    pub new_inbox_messages: Vec<NewInboxMessage>,
    #[serde(default)]
    pub renew_outbox_lease_ids: Vec<MessageId>,
    #[serde(default)]
    pub renew_inbox_lease_ids: Vec<MessageId>,
    pub options: WorkBatchOptions,
}

impl WorkBatchRequest {
    /// An empty request: pure heartbeat plus a claim attempt
    pub fn heartbeat(instance: InstanceDescriptor) -> Self {
        Self {
            instance,
            outbox_completions: Vec::new(),
            outbox_failures: Vec::new(),
            inbox_completions: Vec::new(),
            inbox_failures: Vec::new(),
            new_outbox_messages: Vec::new(),
            new_inbox_messages: Vec::new(),
            renew_outbox_lease_ids: Vec::new(),
            renew_inbox_lease_ids: Vec::new(),
            options: WorkBatchOptions::default(),
        }
    }

    /// Lease renewal only: claims nothing, reports nothing
    pub fn renewal(
        instance: InstanceDescriptor,
        renew_outbox_lease_ids: Vec<MessageId>,
        renew_inbox_lease_ids: Vec<MessageId>,
        mut options: WorkBatchOptions,
    ) -> Self {
        options.batch_size = 0;
        Self {
            renew_outbox_lease_ids,
            renew_inbox_lease_ids,
            options,
            ..Self::heartbeat(instance)
        }
    }

    pub fn has_reports(&self) -> bool {
        !(self.outbox_completions.is_empty()
            && self.outbox_failures.is_empty()
            && self.inbox_completions.is_empty()
            && self.inbox_failures.is_empty()
            && self.new_outbox_messages.is_empty()
            && self.new_inbox_messages.is_empty()
            && self.renew_outbox_lease_ids.is_empty()
            && self.renew_inbox_lease_ids.is_empty())
    }
}

/// Claimed work returned by one coordinator call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkBatchReply {
    #[serde(default)]
    pub outbox: Vec<OutboxWork>,
    #[serde(default)]
    pub inbox: Vec<InboxWork>,
}

impl WorkBatchReply {
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty() && self.inbox.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> InstanceDescriptor {
        InstanceDescriptor {
            instance_id: InstanceId::new(),
            service_name: "billing".to_string(),
            host_name: "host-1".to_string(),
            process_id: 1,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_defaults() {
        let options = WorkBatchOptions::default();
        assert_eq!(options.lease_seconds, 300);
        assert_eq!(options.partition_count, 10_000);
        assert_eq!(options.stale_threshold_seconds, 600);
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.max_attempts, 10);
    }

    #[test]
    fn test_heartbeat_carries_no_reports() {
        let request = WorkBatchRequest::heartbeat(descriptor());
        assert!(!request.has_reports());
    }

    #[test]
    fn test_renewal_claims_nothing() {
        let request =
            WorkBatchRequest::renewal(descriptor(), vec![MessageId::new()], Vec::new(), WorkBatchOptions::default());
        assert_eq!(request.options.batch_size, 0);
        assert!(request.has_reports());
    }

    #[test]
    fn test_release_sentinel_is_zero() {
        let completion = MessageCompletion::release(MessageId::new());
        assert!(completion.status.is_none());
    }
}
