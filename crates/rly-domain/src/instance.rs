//! Service instance registry model
//!
//! Every `process_work_batch` call upserts the caller's row with a fresh
//! heartbeat. The alive set (heartbeat within the stale threshold, same
//! service name) determines partition ownership: instance `i` owns
//! partition `p` iff `p mod N == rank(i)` where `rank` is the position of
//! `i` in the sorted alive-instance-id list.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InstanceId;

/// Default staleness threshold in seconds
pub const DEFAULT_STALE_THRESHOLD_SECONDS: u32 = 600;

/// A registered service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: InstanceId,
    pub service_name: String,
    pub host_name: String,
    pub process_id: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Opaque operational metadata; never interpreted by the coordinator
    pub metadata: serde_json::Value,
}

impl ServiceInstance {
    pub fn is_alive(&self, now: DateTime<Utc>, stale_threshold_seconds: u32) -> bool {
        self.last_heartbeat_at > now - Duration::seconds(i64::from(stale_threshold_seconds))
    }
}

/// Deterministic rank of an instance within its alive peers
///
/// `alive` does not need to be pre-sorted. Returns `(rank, count)`, or
/// `None` when the instance is not in the set.
pub fn instance_rank(instance_id: &InstanceId, alive: &[InstanceId]) -> Option<(u32, u32)> {
    let mut sorted: Vec<&InstanceId> = alive.iter().collect();
    sorted.sort();
    sorted.dedup();
    let count = sorted.len() as u32;
    sorted
        .iter()
        .position(|i| *i == instance_id)
        .map(|rank| (rank as u32, count))
}
