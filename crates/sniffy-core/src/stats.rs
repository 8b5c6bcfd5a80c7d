//! Per-identity counters.
//!
//! `StatsCounter` is the live, shared form: atomics that are only ever
//! incremented. `StatsValues` is a plain copy used for snapshots, deltas and
//! increments.

use serde::Serialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StatsCounter {
    elapsed_nanos: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    rows_affected: AtomicU64,
    operations: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every field of `delta`. Fields are independent; a concurrent
    /// reader may observe some of them already updated.
    pub fn accumulate(&self, delta: &StatsValues) {
        add(&self.elapsed_nanos, delta.elapsed_nanos);
        add(&self.bytes_sent, delta.bytes_sent);
        add(&self.bytes_received, delta.bytes_received);
        add(&self.rows_affected, delta.rows_affected);
        add(&self.operations, delta.operations);
    }

    pub fn values(&self) -> StatsValues {
        StatsValues {
            elapsed_nanos: self.elapsed_nanos.load(Ordering::Acquire),
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            bytes_received: self.bytes_received.load(Ordering::Acquire),
            rows_affected: self.rows_affected.load(Ordering::Acquire),
            operations: self.operations.load(Ordering::Acquire),
        }
    }
}

fn add(counter: &AtomicU64, value: u64) {
    if value != 0 {
        counter.fetch_add(value, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsValues {
    pub elapsed_nanos: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rows_affected: u64,
    pub operations: u64,
}

impl StatsValues {
    /// One operation that took `elapsed_nanos`.
    pub fn operation(elapsed_nanos: u64) -> Self {
        Self {
            elapsed_nanos,
            operations: 1,
            ..Default::default()
        }
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows_affected = rows;
        self
    }

    pub fn with_sent(mut self, bytes: u64) -> Self {
        self.bytes_sent = bytes;
        self
    }

    pub fn with_received(mut self, bytes: u64) -> Self {
        self.bytes_received = bytes;
        self
    }

    /// Difference against an earlier snapshot of the same counter.
    ///
    /// A regression in any field means the counter was dropped and recreated
    /// in between (aggregator `clear`); the current values are then the delta.
    pub fn since(&self, baseline: &StatsValues) -> StatsValues {
        let fields = [
            du64(self.elapsed_nanos, baseline.elapsed_nanos),
            du64(self.bytes_sent, baseline.bytes_sent),
            du64(self.bytes_received, baseline.bytes_received),
            du64(self.rows_affected, baseline.rows_affected),
            du64(self.operations, baseline.operations),
        ];
        match fields {
            [
                Some(elapsed_nanos),
                Some(bytes_sent),
                Some(bytes_received),
                Some(rows_affected),
                Some(operations),
            ] => StatsValues {
                elapsed_nanos,
                bytes_sent,
                bytes_received,
                rows_affected,
                operations,
            },
            _ => *self,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == StatsValues::default()
    }
}

impl AddAssign for StatsValues {
    fn add_assign(&mut self, rhs: Self) {
        self.elapsed_nanos = self.elapsed_nanos.saturating_add(rhs.elapsed_nanos);
        self.bytes_sent = self.bytes_sent.saturating_add(rhs.bytes_sent);
        self.bytes_received = self.bytes_received.saturating_add(rhs.bytes_received);
        self.rows_affected = self.rows_affected.saturating_add(rhs.rows_affected);
        self.operations = self.operations.saturating_add(rhs.operations);
    }
}

/// Delta between two readings of a monotonic counter; `None` on regression.
pub fn du64(curr: u64, prev: u64) -> Option<u64> {
    curr.checked_sub(prev)
}
