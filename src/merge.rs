use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

use crate::{
    accumulator::{Accumulator, AccumulatorCell},
    bucket::{DirtySet, ReleaseClass, SharedBucket},
    config::TrackerConfig,
    debt::{self, Repayment},
    guard::ReentrancyGuard,
    record::{AddressKey, ThreadKey},
    stats::Counters,
};

#[derive(Default)]
struct HandoffState {
    batch: Vec<Accumulator>,
    shutdown: bool,
}

/// Accumulators handed off by application threads, waiting for the merge worker.
#[derive(Default)]
struct HandoffQueue {
    state: Mutex<HandoffState>,
    ready: Condvar,
}

impl HandoffQueue {
    fn push(&self, accumulator: Accumulator) {
        self.state.lock().batch.push(accumulator);
        self.ready.notify_one();
    }

    fn drain(&self) -> Vec<Accumulator> {
        std::mem::take(&mut self.state.lock().batch)
    }

    /// Sleeps until there is work, shutdown is requested, or `deadline` passes. Returns whether to shut down.
    fn wait(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while state.batch.is_empty() && !state.shutdown {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.shutdown
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.ready.notify_all();
    }
}

/// The merge engine: folds accumulators into the shared bucket and reconciles cross-thread frees.
///
/// ## Lock order
///
/// `merge_lock` is outermost and serializes merges. Under it, the registry is taken before any accumulator, and the
/// bucket before the dirty set; the registry/accumulator pair is always released before the bucket is taken. The
/// handoff queue is a leaf and may be taken while holding an accumulator. Application threads only ever hold their
/// own accumulator, the handoff queue, the registry (on first use and exit), or the dirty set, and never more than
/// an accumulator plus the handoff queue at once.
pub(crate) struct Merger {
    capacity: usize,
    high_water_mark: usize,
    interval: Duration,
    counters: Arc<Counters>,
    handoff: HandoffQueue,
    registry: Mutex<HashMap<ThreadKey, AccumulatorCell>>,
    merge_lock: Mutex<()>,
    bucket: RwLock<SharedBucket>,
    dirty: Mutex<DirtySet>,
}

impl Merger {
    pub fn new(config: &TrackerConfig, counters: Arc<Counters>) -> Self {
        Self {
            capacity: config.accumulator_capacity,
            high_water_mark: config.high_water_mark(),
            interval: config.full_merge_interval(),
            counters,
            handoff: HandoffQueue::default(),
            registry: Mutex::new(HashMap::new()),
            merge_lock: Mutex::new(()),
            bucket: RwLock::new(SharedBucket::default()),
            dirty: Mutex::new(DirtySet::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds a thread's accumulator to the live-accumulator registry.
    pub fn register(&self, thread: ThreadKey, cell: &AccumulatorCell) {
        self.registry.lock().insert(thread, Arc::clone(cell));
    }

    /// Deregisters an exiting thread and hands its remaining bookkeeping off.
    pub fn retire_thread(&self, cell: &AccumulatorCell) {
        // The handoff happens under the accumulator lock so a concurrent full merge sees the contents in one place or
        // the other.
        let thread = {
            let mut accumulator = cell.lock();
            let remaining = accumulator.take();
            if !remaining.is_empty() {
                self.hand_off(remaining);
            }
            accumulator.thread()
        };

        self.registry.lock().remove(&thread);
        tracing::trace!(thread = thread.0, "thread retired from tracking");
    }

    /// Queues a full accumulator for the merge worker and wakes it.
    pub fn hand_off(&self, accumulator: Accumulator) {
        Counters::bump(&self.counters.handoffs);
        self.handoff.push(accumulator);
    }

    /// Queues bookkeeping recorded without a thread-local accumulator.
    pub fn hand_off_orphan(&self, accumulator: Accumulator) {
        Counters::bump(&self.counters.orphan_handoffs);
        self.handoff.push(accumulator);
    }

    /// Classifies a release that missed the releasing thread's accumulator.
    pub fn classify_release(&self, key: AddressKey) -> ReleaseClass {
        self.dirty.lock().classify_release(key)
    }

    /// Folds every handed-off accumulator into the bucket.
    ///
    /// Returns `true` if outstanding borrowed frees now exceed the high-water mark.
    pub fn minor_merge(&self) -> bool {
        let _merge = self.merge_lock.lock();
        let batch = self.handoff.drain();
        if batch.is_empty() {
            return false;
        }

        let mut bucket = self.bucket.write();
        let mut dirty = self.dirty.lock();
        let (mut records, mut frees) = (0, 0);
        for accumulator in batch {
            let absorbed = bucket.absorb(accumulator, &mut dirty);
            records += absorbed.records;
            frees += absorbed.frees;
            Counters::add(&self.counters.stale_evictions, absorbed.superseded);
        }
        Counters::bump(&self.counters.minor_merges);

        let outstanding = bucket.outstanding();
        tracing::trace!(records, frees, outstanding, "minor merge");
        outstanding > self.high_water_mark
    }

    /// Flushes every live accumulator, folds everything into the bucket, and repays outstanding debts.
    ///
    /// This is the only operation that observes a globally consistent snapshot. Each accumulator lock is held only
    /// for the swap, so a busy thread delays this by at most one hooked call.
    pub fn full_merge(&self) -> Repayment {
        let _merge = self.merge_lock.lock();

        let mut drained = Vec::new();
        {
            let registry = self.registry.lock();
            for cell in registry.values() {
                let mut accumulator = cell.lock();
                if !accumulator.is_empty() {
                    drained.push(accumulator.take());
                }
            }
        }
        let flushed = drained.len();
        drained.extend(self.handoff.drain());

        let mut bucket = self.bucket.write();
        let mut dirty = self.dirty.lock();
        for accumulator in drained {
            let absorbed = bucket.absorb(accumulator, &mut dirty);
            Counters::add(&self.counters.stale_evictions, absorbed.superseded);
        }

        let repayment = debt::repay(&mut bucket, &mut dirty);
        Counters::add(&self.counters.lost_pointers, repayment.lost);
        Counters::bump(&self.counters.full_merges);

        tracing::debug!(
            flushed,
            repaid = repayment.repaid,
            lost = repayment.lost,
            live = bucket.live_len(),
            "full merge"
        );
        repayment
    }

    pub fn bucket(&self) -> RwLockReadGuard<'_, SharedBucket> {
        self.bucket.read()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    #[cfg(test)]
    pub fn live_threads(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn shutdown(&self) {
        self.handoff.shutdown();
    }

    /// Body of the merge worker thread.
    pub fn run(&self) {
        let _untracked = ReentrancyGuard::hold();
        tracing::debug!("merge worker started");

        let mut last_full = Instant::now();
        loop {
            let deadline = last_full + self.interval;
            let shutdown = self.handoff.wait(deadline);
            let over_mark = self.minor_merge();
            if shutdown {
                break;
            }

            if over_mark || Instant::now() >= deadline {
                self.full_merge();
                last_full = Instant::now();
            }
        }

        tracing::debug!("merge worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AllocationRecord, FreeRecord, RegionKind, Stamp, StackHash};

    fn merger(capacity: usize) -> Merger {
        let config = TrackerConfig::builder().accumulator_capacity(capacity).build();
        Merger::new(&config, Arc::new(Counters::default()))
    }

    fn record(address: usize, stamp: u64, thread: u64) -> AllocationRecord {
        AllocationRecord {
            address,
            size: 10,
            caller: 0,
            kind: RegionKind::Heap,
            stack_hash: StackHash::NONE,
            stamp: Stamp(stamp),
            thread: ThreadKey(thread),
        }
    }

    #[test]
    fn minor_merge_folds_handoffs() {
        let merger = merger(4);
        let mut acc = Accumulator::new(ThreadKey(1));
        acc.record_acquire(record(0x10, 1, 1), None);
        merger.hand_off(acc);

        assert!(!merger.minor_merge());
        assert_eq!(merger.bucket().live_len(), 1);
        assert!(!merger.minor_merge());
    }

    #[test]
    fn minor_merge_reports_high_water_mark() {
        let config = TrackerConfig::builder()
            .accumulator_capacity(4)
            .full_merge_high_water_mark(2)
            .build();
        let merger = Merger::new(&config, Arc::new(Counters::default()));

        let mut acc = Accumulator::new(ThreadKey(1));
        for stamp in 0..3 {
            acc.borrow(FreeRecord {
                address: 0x10 + stamp as usize,
                kind: RegionKind::Heap,
                stamp: Stamp(stamp),
            });
        }
        merger.hand_off(acc);
        assert!(merger.minor_merge());
    }

    #[test]
    fn full_merge_flushes_registered_accumulators() {
        let merger = merger(100);
        let allocator: AccumulatorCell = Arc::new(Mutex::new(Accumulator::new(ThreadKey(1))));
        let releaser: AccumulatorCell = Arc::new(Mutex::new(Accumulator::new(ThreadKey(2))));
        merger.register(ThreadKey(1), &allocator);
        merger.register(ThreadKey(2), &releaser);

        allocator.lock().record_acquire(record(0x10, 1, 1), None);
        releaser.lock().borrow(FreeRecord {
            address: 0x10,
            kind: RegionKind::Heap,
            stamp: Stamp(2),
        });

        let repayment = merger.full_merge();
        assert_eq!(repayment.repaid, 1);
        assert_eq!(merger.bucket().live_len(), 0);
        assert!(allocator.lock().is_empty());
        assert!(releaser.lock().is_empty());
    }

    #[test]
    fn retired_threads_leave_the_registry_and_hand_off() {
        let merger = merger(100);
        let cell: AccumulatorCell = Arc::new(Mutex::new(Accumulator::new(ThreadKey(3))));
        merger.register(ThreadKey(3), &cell);
        cell.lock().record_acquire(record(0x10, 1, 3), None);
        assert_eq!(merger.live_threads(), 1);

        merger.retire_thread(&cell);
        assert_eq!(merger.live_threads(), 0);
        assert!(!merger.handoff.state.lock().batch.is_empty());

        merger.minor_merge();
        assert_eq!(merger.bucket().live_len(), 1);
    }

    #[test]
    fn worker_exits_on_shutdown() {
        let merger = Arc::new(merger(4));
        let worker = {
            let merger = Arc::clone(&merger);
            std::thread::spawn(move || merger.run())
        };

        merger.shutdown();
        worker.join().expect("worker should stop cleanly");
    }
}
