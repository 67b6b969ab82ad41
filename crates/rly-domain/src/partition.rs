//! Deterministic partitioning
//!
//! `partition_number` must be a pure function of `stream_id`, stable across
//! instances, platforms, and releases: every instance must agree on who owns
//! a stream without talking to each other. The first four bytes of the
//! SHA-256 digest give a uniform 32-bit value to reduce modulo the partition
//! count.

use sha2::{Digest, Sha256};

use crate::ids::StreamId;

/// Default partition space
pub const DEFAULT_PARTITION_COUNT: u32 = 10_000;

/// Compute the partition for a stream
pub fn partition_for_stream(stream_id: &StreamId, partition_count: u32) -> u32 {
    let digest = Sha256::digest(stream_id.as_str().as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % partition_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_deterministic() {
        let stream = StreamId::from_string("order-1234".to_string());
        let a = partition_for_stream(&stream, DEFAULT_PARTITION_COUNT);
        let b = partition_for_stream(&stream, DEFAULT_PARTITION_COUNT);
        assert_eq!(a, b);
    }

    #[test]
    fn test_partition_in_range() {
        for i in 0..200 {
            let stream = StreamId::from_string(format!("stream-{i}"));
            let p = partition_for_stream(&stream, 16);
            assert!(p < 16);
        }
    }

    #[test]
    fn test_partition_count_one_collapses() {
        let stream = StreamId::new();
        assert_eq!(partition_for_stream(&stream, 1), 0);
    }

    #[test]
    fn test_zero_count_does_not_panic() {
        let stream = StreamId::new();
        assert_eq!(partition_for_stream(&stream, 0), 0);
    }
}
