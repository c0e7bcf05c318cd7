use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Diagnostic counters shared by every part of an engine.
///
/// Anomalies are never surfaced as errors on the interception path; they only show up here and in dumps.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub invalid_pointers: AtomicU64,
    pub lost_pointers: AtomicU64,
    pub stale_evictions: AtomicU64,
    pub handoffs: AtomicU64,
    pub orphan_handoffs: AtomicU64,
    pub minor_merges: AtomicU64,
    pub full_merges: AtomicU64,
    pub stack_mismatches: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: usize) {
        if value != 0 {
            counter.fetch_add(value as u64, Ordering::Relaxed);
        }
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of an engine's diagnostic totals.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Live records in the shared bucket.
    pub live_pointers: usize,
    /// Live stack aggregates in the shared bucket.
    pub live_stacks: usize,
    /// Releases that never matched an allocation. Monotonic.
    pub lost_pointers: u64,
    /// Acquires with a null result and releases of a null pointer.
    pub invalid_pointers: u64,
    /// Stack captures attempted.
    pub stack_captures: u64,
    /// Stack captures that failed and were recorded without a stack.
    pub unwind_failures: u64,
    /// Records replaced by a newer record for the same address.
    pub stale_evictions: u64,
    /// Addresses currently marked dirty.
    pub dirty_addresses: usize,
    /// Borrowed frees merged but not yet repaid.
    pub outstanding_frees: usize,
    /// Accumulators handed to the merge engine for exceeding capacity or on thread exit.
    pub handoffs: u64,
    /// Events recorded after their thread's accumulator was torn down.
    pub orphan_handoffs: u64,
    /// Minor merges performed.
    pub minor_merges: u64,
    /// Full merges performed.
    pub full_merges: u64,
    /// Stack aggregates whose running total disagreed with a recount during a dump.
    pub stack_mismatches: u64,
}
