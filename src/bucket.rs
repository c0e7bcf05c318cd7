use std::collections::{hash_map::Entry, HashMap, HashSet};

use crate::{
    accumulator::{detach_stack, Accumulator},
    record::{AddressKey, AllocationRecord, FreeRecord, StackAggregate, StackKey, ThreadKey},
};

/// What a release that missed locally found in the dirty-address lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseClass {
    /// The address belongs to a record already merged into the shared bucket by the given thread.
    Flushed(ThreadKey),
    /// Nobody is known to own the address yet; it has been marked dirty.
    Ambiguous,
}

/// Addresses whose ownership is currently ambiguous across threads.
///
/// Also carries the owner index built by merges (which thread's flushed record holds each address) so that the
/// release path can classify a miss under this lock alone, without touching the bucket.
#[derive(Debug, Default)]
pub(crate) struct DirtySet {
    dirty: HashSet<AddressKey>,
    flushed: HashMap<AddressKey, ThreadKey>,
}

impl DirtySet {
    pub fn classify_release(&mut self, key: AddressKey) -> ReleaseClass {
        match self.flushed.get(&key) {
            Some(owner) => ReleaseClass::Flushed(*owner),
            None => {
                self.dirty.insert(key);
                ReleaseClass::Ambiguous
            }
        }
    }

    pub fn clear(&mut self, key: &AddressKey) {
        self.dirty.remove(key);
    }

    #[cfg(test)]
    pub fn is_dirty(&self, key: &AddressKey) -> bool {
        self.dirty.contains(key)
    }

    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    fn note_flushed(&mut self, key: AddressKey, owner: ThreadKey) {
        self.flushed.insert(key, owner);
    }

    fn forget_flushed(&mut self, key: &AddressKey) {
        self.flushed.remove(key);
    }
}

/// Counts from folding one accumulator into the bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Absorbed {
    pub records: usize,
    pub frees: usize,
    pub superseded: usize,
}

/// The shared view all accumulators are merged into.
///
/// Holds at most one live record per address. A record that loses to a newer record for the same address is dropped
/// as stale and never counts as live again.
#[derive(Debug, Default)]
pub(crate) struct SharedBucket {
    records: HashMap<AddressKey, AllocationRecord>,
    stacks: HashMap<StackKey, StackAggregate>,
    debts: HashMap<AddressKey, Vec<FreeRecord>>,
    outstanding: usize,
}

impl SharedBucket {
    /// Folds an accumulator in: stack totals are summed, records are inserted, and borrowed frees become debts.
    pub fn absorb(&mut self, accumulator: Accumulator, dirty: &mut DirtySet) -> Absorbed {
        let parts = accumulator.into_parts();
        let mut absorbed = Absorbed::default();

        // Stacks go first so that superseding a record below can take its bytes back out.
        for (key, aggregate) in parts.stacks {
            match self.stacks.entry(key) {
                Entry::Occupied(mut entry) => entry.get_mut().attach(aggregate.total),
                Entry::Vacant(entry) => {
                    entry.insert(aggregate);
                }
            }
        }

        for record in parts.records.into_values() {
            absorbed.records += 1;
            if self.insert_live(record, dirty) {
                absorbed.superseded += 1;
            }
        }

        for free in parts.borrowed {
            absorbed.frees += 1;
            self.outstanding += 1;
            self.debts.entry(free.key()).or_default().push(free);
        }

        absorbed
    }

    /// Inserts a live record, keeping whichever of the old and new record has the greater stamp.
    ///
    /// Returns `true` if one of the two was superseded.
    fn insert_live(&mut self, record: AllocationRecord, dirty: &mut DirtySet) -> bool {
        let key = record.key();
        match self.records.entry(key) {
            Entry::Vacant(entry) => {
                dirty.note_flushed(key, record.thread);
                entry.insert(record);
                false
            }
            Entry::Occupied(mut entry) => {
                let loser = if record.stamp > entry.get().stamp {
                    dirty.note_flushed(key, record.thread);
                    entry.insert(record)
                } else {
                    record
                };
                detach_stack(&mut self.stacks, &loser);
                true
            }
        }
    }

    /// Removes the live record for `key`, taking its bytes out of its stack aggregate.
    pub fn retire(&mut self, key: &AddressKey, dirty: &mut DirtySet) -> Option<AllocationRecord> {
        let record = self.records.remove(key)?;
        detach_stack(&mut self.stacks, &record);
        dirty.forget_flushed(key);
        Some(record)
    }

    pub fn live(&self, key: &AddressKey) -> Option<&AllocationRecord> {
        self.records.get(key)
    }

    /// Takes every outstanding debt, resetting the outstanding count.
    pub fn take_debts(&mut self) -> HashMap<AddressKey, Vec<FreeRecord>> {
        self.outstanding = 0;
        std::mem::take(&mut self.debts)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values()
    }

    pub fn live_len(&self) -> usize {
        self.records.len()
    }

    pub fn stacks(&self) -> &HashMap<StackKey, StackAggregate> {
        &self.stacks
    }
}
