//! Message status bitmask
//!
//! Rows advance by OR-ing bits in; a row is done for the outbox once
//! `PUBLISHED` is set, and an inbox row reaching `FULLY_COMPLETED` is
//! deleted by the coordinator.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Status bitmask carried by every outbox/inbox row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusFlags(u32);

impl StatusFlags {
    /// No progress recorded. Reporting a completion with this value is the
    /// "release without progress" sentinel: the lease is cleared and no flag
    /// is modified.
    pub const NONE: StatusFlags = StatusFlags(0);
    /// Row is durably stored
    pub const STORED: StatusFlags = StatusFlags(1);
    /// Handler events were appended to the event store
    pub const EVENT_STORED: StatusFlags = StatusFlags(2);
    /// Message was handed to the transport (outbox) or fully handled (inbox)
    pub const PUBLISHED: StatusFlags = StatusFlags(4);
    /// Last attempt failed; `error` holds the detail
    pub const FAILED: StatusFlags = StatusFlags(8);
    /// Failed row is still eligible for another claim
    pub const RETRY: StatusFlags = StatusFlags(16);

    /// Inbox terminal state; the coordinator deletes rows that reach it.
    pub const FULLY_COMPLETED: StatusFlags = StatusFlags(1 | 2 | 4);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: StatusFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: StatusFlags) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: StatusFlags) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for StatusFlags {
    type Output = StatusFlags;

    fn bitor(self, rhs: StatusFlags) -> StatusFlags {
        self.union(rhs)
    }
}

impl BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: StatusFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in [
            (StatusFlags::STORED, "STORED"),
            (StatusFlags::EVENT_STORED, "EVENT_STORED"),
            (StatusFlags::PUBLISHED, "PUBLISHED"),
            (StatusFlags::FAILED, "FAILED"),
            (StatusFlags::RETRY, "RETRY"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
