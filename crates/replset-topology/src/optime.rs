//! Virtual time and oplog positions.
//!
//! The coordinator never reads a wall clock. Every decision method takes a
//! caller-supplied [`Date`], which makes the whole state machine replayable
//! under virtual time in tests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// An instant in caller-supplied time, in milliseconds since an arbitrary epoch.
///
/// Comparable, addable with [`Duration`], and cheap to copy. The epoch is
/// whatever the caller says it is; only differences and ordering matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Date(u64);

impl Date {
    /// The zero instant. Also the "never happened" sentinel for heartbeat windows.
    pub const ZERO: Date = Date(0);

    pub const fn from_millis(millis: u64) -> Self {
        Date(millis)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Elapsed time since `earlier`, clamped to zero if `earlier` is in the future.
    pub fn saturating_duration_since(&self, earlier: Date) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Date {
    type Output = Date;

    fn add(self, rhs: Duration) -> Date {
        Date(self.0 + rhs.as_millis() as u64)
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A position in the oplog: `(seconds, ordinal)` with lexicographic order.
///
/// The derived `Ord` compares `secs` first and `ordinal` second, which is
/// exactly the ordering the election and sync-source rules rely on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct OpTime {
    pub secs: u64,
    pub ordinal: u64,
}

impl OpTime {
    pub const ZERO: OpTime = OpTime { secs: 0, ordinal: 0 };

    pub const fn new(secs: u64, ordinal: u64) -> Self {
        OpTime { secs, ordinal }
    }

    pub fn is_zero(&self) -> bool {
        *self == OpTime::ZERO
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.ordinal)
    }
}
