//! Timestamp policies and clock sources
//!
//! A table picks its timestamp policy once, at creation:
//!
//! - `Logical`: a per-table counter, strictly increasing on every write no
//!   matter what any node's wall clock says.
//! - `WallClock`: milliseconds from the injected `Clock`, clamped so that a
//!   table's timestamps never go backwards.
//!
//! The clock is injected so tests can freeze or rewind time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// How write timestamps are assigned for a table. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimestampPolicy {
    Logical,
    WallClock,
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        TimestampPolicy::WallClock
    }
}

impl fmt::Display for TimestampPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampPolicy::Logical => f.write_str("logical"),
            TimestampPolicy::WallClock => f.write_str("wallclock"),
        }
    }
}

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

/// Manually driven clock for simulating frozen or skewed nodes.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Per-table timestamp state.
///
/// `last` is the last timestamp handed out. For logical tables it is the
/// logical counter and is carried through clone, export and import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableTime {
    policy: TimestampPolicy,
    last: u64,
}

impl TableTime {
    pub fn new(policy: TimestampPolicy) -> Self {
        Self { policy, last: 0 }
    }

    /// Restore from exported or cloned state.
    pub fn restore(policy: TimestampPolicy, last: u64) -> Self {
        Self { policy, last }
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    /// Assign the timestamp for the next write. `None` once a logical
    /// counter has reached `u64::MAX`; the counter is left unchanged.
    pub fn next(&mut self, clock: &dyn Clock) -> Option<u64> {
        self.last = match self.policy {
            TimestampPolicy::Logical => self.last.checked_add(1)?,
            TimestampPolicy::WallClock => clock.now_millis().max(self.last),
        };
        Some(self.last)
    }
}
