//! Claim planning
//!
//! The selection logic at the heart of `process_work_batch`. The in-memory
//! store executes these functions directly; the PostgreSQL adapter mirrors
//! them clause-for-clause in SQL. Keeping the rules here, pure and
//! synchronous, is what makes the protocol testable without a database.
//!
//! Selection rules, in priority order:
//! 1. Only rows whose partition belongs to the claimer under the current
//!    alive-instance count (`partition mod N == rank`).
//! 2. Only rows that are unleased or whose lease has expired.
//! 3. Never a row that is `PUBLISHED`, or `FAILED` without `RETRY`.
//! 4. Never a row with an older same-stream row that is leased by a
//!    different instance with an active lease, or that failed terminally.
//!    The earliest-remaining row of a stream is always eligible for its
//!    partition owner.
//! 5. Ascending `created_at`, tie-broken by `message_id`, up to the batch
//!    size.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::flags::StatusFlags;
use crate::ids::{InstanceId, MessageId, StreamId};
use crate::instance::instance_rank;

/// The fields of an outbox/inbox row the planner needs
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    pub message_id: MessageId,
    pub stream_id: StreamId,
    pub partition_number: u32,
    pub status_flags: StatusFlags,
    pub attempts: u32,
    pub instance_id: Option<InstanceId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RowSnapshot {
    /// A lease is active while its expiry has not passed
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expiry, Some(expiry) if expiry >= now)
    }

    /// Candidate condition: unleased, or lease expired
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.instance_id.is_none() || !self.lease_active(now)
    }

    /// `FAILED` without `RETRY`: parked until an operator resolves it
    pub fn is_terminal_failure(&self) -> bool {
        self.status_flags.contains(StatusFlags::FAILED)
            && !self.status_flags.contains(StatusFlags::RETRY)
    }

    fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.message_id)
    }
}

/// Plan the claim set for one instance over one queue
///
/// `rows` is the full set of not-yet-published rows for the queue (published
/// rows may be present and are ignored). `alive` is the alive-peer set that
/// includes the claimer; the claimer's rank within it decides partition
/// ownership.
pub fn plan_claims(
    rows: &[RowSnapshot],
    claimer: &InstanceId,
    alive: &[InstanceId],
    now: DateTime<Utc>,
    batch_size: usize,
) -> Vec<MessageId> {
    let Some((rank, count)) = instance_rank(claimer, alive) else {
        return Vec::new();
    };
    if batch_size == 0 || count == 0 {
        return Vec::new();
    }

    let mut ordered: Vec<&RowSnapshot> = rows.iter().collect();
    ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut stream_blocked: HashMap<&StreamId, bool> = HashMap::new();
    let mut claims = Vec::new();

    for row in ordered {
        if row.status_flags.contains(StatusFlags::PUBLISHED) {
            continue;
        }

        let blocked = stream_blocked.entry(&row.stream_id).or_insert(false);
        if *blocked {
            continue;
        }

        // An older pending row pins its stream when it is held elsewhere or
        // parked; nothing after it may be handed out until it resolves.
        let held_elsewhere = match &row.instance_id {
            Some(owner) => owner != claimer && row.lease_active(now),
            None => false,
        };
        if held_elsewhere || row.is_terminal_failure() {
            *blocked = true;
            continue;
        }

        if claims.len() >= batch_size {
            break;
        }

        let retryable = !row.status_flags.contains(StatusFlags::FAILED)
            || row.status_flags.contains(StatusFlags::RETRY);
        let owned_partition = row.partition_number % count == rank;

        if row.is_available(now) && retryable && owned_partition {
            claims.push(row.message_id.clone());
        }
    }

    claims
}

/// Flags after a non-zero completion report
///
/// A completion on a previously failed row resolves the failure: the
/// `FAILED|RETRY` bits are cleared before the reported status is OR-ed in.
pub fn completion_flags(current: StatusFlags, reported: StatusFlags) -> StatusFlags {
    current
        .without(StatusFlags::FAILED | StatusFlags::RETRY)
        .union(reported)
}

/// Flags after a failure report
///
/// Sets `FAILED|RETRY` and ORs in the progress made before the failure;
/// once `attempts_after` reaches the cap, `RETRY` is withheld and the row
/// is parked.
pub fn failure_flags(
    current: StatusFlags,
    completed_status: StatusFlags,
    attempts_after: u32,
    max_attempts: u32,
) -> StatusFlags {
    let flags = current
        .union(completed_status)
        .union(StatusFlags::FAILED)
        .union(StatusFlags::RETRY);
    if attempts_after >= max_attempts {
        flags.without(StatusFlags::RETRY)
    } else {
        flags
    }
}

/// Rows released by the stream failure cascade
///
/// Every not-yet-published row strictly later than the failed one in the
/// same stream loses its lease (flags untouched), so nothing downstream is
/// delivered while the stream is stuck.
pub fn cascade_release_targets(
    rows: &[RowSnapshot],
    failed_stream: &StreamId,
    failed_created_at: DateTime<Utc>,
    failed_message_id: &MessageId,
) -> Vec<MessageId> {
    let failed_key = (failed_created_at, failed_message_id);
    rows.iter()
        .filter(|row| {
            &row.stream_id == failed_stream
                && !row.status_flags.contains(StatusFlags::PUBLISHED)
                && row.sort_key() > failed_key
        })
        .map(|row| row.message_id.clone())
        .collect()
}
