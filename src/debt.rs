use crate::{
    bucket::{DirtySet, SharedBucket},
    record::FreeRecord,
};

/// Outcome of one debt repayment pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Repayment {
    /// Frees that retired a live record.
    pub repaid: usize,
    /// Frees that matched nothing.
    pub lost: usize,
}

/// Matches every outstanding borrowed free against the records sharing its address.
///
/// Frees at one address are replayed in stamp order. Only the live record, the one with the greatest stamp, is
/// authoritative: a free retires it if it happened after that record was allocated, and is lost otherwise. Records
/// it replaced were already dropped as stale and never match. Every address visited is cleared from the dirty set
/// whatever the outcome.
pub(crate) fn repay(bucket: &mut SharedBucket, dirty: &mut DirtySet) -> Repayment {
    let mut repayment = Repayment::default();

    for (key, mut frees) in bucket.take_debts() {
        frees.sort_unstable_by_key(|free: &FreeRecord| free.stamp);

        for free in frees {
            let retires_live = bucket
                .live(&key)
                .map_or(false, |record| free.stamp > record.stamp);

            if retires_live {
                bucket.retire(&key, dirty);
                repayment.repaid += 1;
            } else {
                repayment.lost += 1;
            }
        }

        dirty.clear(&key);
    }

    repayment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accumulator::Accumulator,
        bucket::ReleaseClass,
        record::{AddressKey, AllocationRecord, RegionKind, Stamp, StackHash, ThreadKey},
    };

    fn record(address: usize, stamp: u64, thread: u64) -> AllocationRecord {
        AllocationRecord {
            address,
            size: 16,
            caller: 0xc1,
            kind: RegionKind::Heap,
            stack_hash: StackHash::NONE,
            stamp: Stamp(stamp),
            thread: ThreadKey(thread),
        }
    }

    fn free(address: usize, stamp: u64) -> FreeRecord {
        FreeRecord {
            address,
            kind: RegionKind::Heap,
            stamp: Stamp(stamp),
        }
    }

    fn key(address: usize) -> AddressKey {
        AddressKey::new(RegionKind::Heap, address)
    }

    fn absorb(
        bucket: &mut SharedBucket,
        dirty: &mut DirtySet,
        thread: u64,
        records: &[AllocationRecord],
        frees: &[FreeRecord],
    ) {
        let mut acc = Accumulator::new(ThreadKey(thread));
        for record in records {
            acc.record_acquire(record.clone(), None);
        }
        for free in frees {
            acc.borrow(*free);
        }
        bucket.absorb(acc, dirty);
    }

    #[test]
    fn later_free_retires_record_from_other_thread() {
        let mut bucket = SharedBucket::default();
        let mut dirty = DirtySet::default();

        absorb(&mut bucket, &mut dirty, 1, &[record(0x10, 1, 1), record(0x20, 2, 1)], &[]);
        absorb(&mut bucket, &mut dirty, 2, &[], &[free(0x10, 3), free(0x20, 4)]);

        let repayment = repay(&mut bucket, &mut dirty);
        assert_eq!(repayment.repaid, 2);
        assert_eq!(repayment.lost, 0);
        assert_eq!(bucket.live_len(), 0);
    }

    #[test]
    fn free_older_than_live_record_does_not_retire_it() {
        let mut bucket = SharedBucket::default();
        let mut dirty = DirtySet::default();

        absorb(&mut bucket, &mut dirty, 1, &[record(0x10, 5, 1)], &[]);
        absorb(&mut bucket, &mut dirty, 2, &[], &[free(0x10, 3)]);

        let repayment = repay(&mut bucket, &mut dirty);
        assert_eq!(repayment.lost, 1);
        assert_eq!(bucket.live(&key(0x10)).map(|r| r.stamp), Some(Stamp(5)));
    }

    #[test]
    fn free_between_reuses_never_matches_the_stale_record() {
        let mut bucket = SharedBucket::default();
        let mut dirty = DirtySet::default();

        // Thread 1 allocates 0x10 twice; the release in between happened on thread 2.
        absorb(&mut bucket, &mut dirty, 1, &[record(0x10, 1, 1), record(0x10, 3, 1)], &[]);
        absorb(&mut bucket, &mut dirty, 2, &[], &[free(0x10, 2)]);

        let repayment = repay(&mut bucket, &mut dirty);
        assert_eq!(repayment.repaid, 0);
        assert_eq!(repayment.lost, 1);
        assert_eq!(bucket.live(&key(0x10)).map(|r| r.stamp), Some(Stamp(3)));
    }

    #[test]
    fn unmatched_and_double_frees_are_lost() {
        let mut bucket = SharedBucket::default();
        let mut dirty = DirtySet::default();

        absorb(&mut bucket, &mut dirty, 1, &[record(0x10, 1, 1)], &[]);
        absorb(&mut bucket, &mut dirty, 2, &[], &[free(0x10, 2), free(0x10, 3), free(0x99, 4)]);

        let repayment = repay(&mut bucket, &mut dirty);
        assert_eq!(repayment.repaid, 1);
        assert_eq!(repayment.lost, 2);
    }

    #[test]
    fn stale_records_without_debts_leave_the_newest() {
        let mut bucket = SharedBucket::default();
        let mut dirty = DirtySet::default();

        absorb(&mut bucket, &mut dirty, 1, &[record(0x10, 1, 1)], &[]);
        absorb(&mut bucket, &mut dirty, 2, &[record(0x10, 2, 2)], &[]);

        let repayment = repay(&mut bucket, &mut dirty);
        assert_eq!(repayment, Repayment::default());
        assert_eq!(bucket.live_len(), 1);
        assert_eq!(bucket.live(&key(0x10)).map(|r| r.thread), Some(ThreadKey(2)));
    }

    #[test]
    fn visited_addresses_leave_the_dirty_set() {
        let mut bucket = SharedBucket::default();
        let mut dirty = DirtySet::default();

        assert_eq!(dirty.classify_release(key(0x10)), ReleaseClass::Ambiguous);
        assert_eq!(dirty.classify_release(key(0x20)), ReleaseClass::Ambiguous);
        absorb(&mut bucket, &mut dirty, 1, &[record(0x10, 1, 1)], &[]);
        absorb(&mut bucket, &mut dirty, 2, &[], &[free(0x10, 2), free(0x20, 3)]);

        repay(&mut bucket, &mut dirty);
        assert_eq!(dirty.len(), 0);
        assert_eq!(bucket.outstanding(), 0);
    }
}
