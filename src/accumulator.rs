use std::{
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    mem,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    guard::{current_thread_key, ReentrancyGuard},
    merge::Merger,
    record::{AddressKey, AllocationRecord, FreeRecord, StackAggregate, StackKey, ThreadKey},
    stack::CapturedStack,
};

/// An accumulator shared between its owning thread and the live-accumulator registry.
pub(crate) type AccumulatorCell = Arc<Mutex<Accumulator>>;

/// Pending bookkeeping of one thread.
///
/// Holds the allocations the thread made since its last handoff, the stack aggregates those allocations feed, and
/// the releases it could not resolve locally. A record replaced by a newer record for the same address before any
/// release was seen is dropped as stale.
#[derive(Debug)]
pub(crate) struct Accumulator {
    thread: ThreadKey,
    records: HashMap<AddressKey, AllocationRecord>,
    stacks: HashMap<StackKey, StackAggregate>,
    borrowed: Vec<FreeRecord>,
}

/// Contents of an accumulator handed to the merge engine.
pub(crate) struct AccumulatorParts {
    pub records: HashMap<AddressKey, AllocationRecord>,
    pub stacks: HashMap<StackKey, StackAggregate>,
    pub borrowed: Vec<FreeRecord>,
}

impl Accumulator {
    pub fn new(thread: ThreadKey) -> Self {
        Self {
            thread,
            records: HashMap::new(),
            stacks: HashMap::new(),
            borrowed: Vec::new(),
        }
    }

    pub fn thread(&self) -> ThreadKey {
        self.thread
    }

    /// Inserts a new live record, returning `true` if it superseded an older record for the same address.
    pub fn record_acquire(&mut self, record: AllocationRecord, stack: Option<&CapturedStack>) -> bool {
        if let (Some(key), Some(stack)) = (record.stack_key(), stack) {
            self.stacks
                .entry(key)
                .or_insert_with(|| StackAggregate::new(stack.hash, Arc::clone(&stack.frames), record.caller))
                .attach(record.size);
        }

        match self.records.insert(record.key(), record) {
            Some(previous) => {
                detach_stack(&mut self.stacks, &previous);
                true
            }
            None => false,
        }
    }

    /// Resolves a release against this thread's own pending records.
    pub fn release_local(&mut self, key: AddressKey) -> Option<AllocationRecord> {
        let record = self.records.remove(&key)?;
        detach_stack(&mut self.stacks, &record);
        Some(record)
    }

    /// Queues a release that could not be resolved locally.
    pub fn borrow(&mut self, free: FreeRecord) {
        self.borrowed.push(free);
    }

    pub fn over_capacity(&self, capacity: usize) -> bool {
        self.records.len() > capacity
            || self.stacks.len() > capacity
            || self.borrowed.len() > capacity
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.stacks.is_empty() && self.borrowed.is_empty()
    }

    /// Swaps the contents out, leaving a fresh accumulator for the same thread in place.
    pub fn take(&mut self) -> Accumulator {
        mem::replace(self, Accumulator::new(self.thread))
    }

    pub fn into_parts(self) -> AccumulatorParts {
        AccumulatorParts {
            records: self.records,
            stacks: self.stacks,
            borrowed: self.borrowed,
        }
    }

    #[cfg(test)]
    pub fn stack_total(&self, key: &StackKey) -> Option<usize> {
        self.stacks.get(key).map(|stack| stack.total)
    }

    #[cfg(test)]
    pub fn live_len(&self) -> usize {
        self.records.len()
    }
}

/// Removes a record's bytes from its stack aggregate, dropping the aggregate once it is empty.
pub(crate) fn detach_stack(stacks: &mut HashMap<StackKey, StackAggregate>, record: &AllocationRecord) {
    if let Some(key) = record.stack_key() {
        if let Entry::Occupied(mut entry) = stacks.entry(key) {
            if entry.get_mut().detach(record.size) {
                entry.remove();
            }
        }
    }
}

thread_local! {
    /// Accumulators owned by this thread, one per live engine.
    ///
    /// Dropped when the thread exits, which hands every non-empty accumulator back to its engine.
    static LOCAL_SLOTS: RefCell<LocalSlots> = RefCell::new(LocalSlots::default());
}

struct LocalSlot {
    engine_id: u64,
    merger: Weak<Merger>,
    cell: AccumulatorCell,
}

#[derive(Default)]
struct LocalSlots {
    slots: Vec<LocalSlot>,
}

impl LocalSlots {
    fn cell_for(&mut self, engine_id: u64, merger: &Arc<Merger>) -> AccumulatorCell {
        if let Some(slot) = self.slots.iter().find(|slot| slot.engine_id == engine_id) {
            return Arc::clone(&slot.cell);
        }

        // Engines that have shut down leave their slots behind; prune them while we are here.
        self.slots.retain(|slot| slot.merger.strong_count() > 0);

        let thread = current_thread_key();
        let cell = Arc::new(Mutex::new(Accumulator::new(thread)));
        merger.register(thread, &cell);
        self.slots.push(LocalSlot {
            engine_id,
            merger: Arc::downgrade(merger),
            cell: Arc::clone(&cell),
        });
        cell
    }
}

impl Drop for LocalSlots {
    fn drop(&mut self) {
        let _guard = ReentrancyGuard::hold();
        for slot in self.slots.drain(..) {
            if let Some(merger) = slot.merger.upgrade() {
                merger.retire_thread(&slot.cell);
            }
        }
    }
}

/// Returns the calling thread's accumulator for the engine identified by `engine_id`, registering it on first use.
///
/// Returns `None` once the thread has started tearing down its thread-locals; callers fall back to a one-off
/// accumulator handed straight to the merge engine.
pub(crate) fn local_cell(engine_id: u64, merger: &Arc<Merger>) -> Option<AccumulatorCell> {
    LOCAL_SLOTS
        .try_with(|slots| {
            slots
                .try_borrow_mut()
                .ok()
                .map(|mut slots| slots.cell_for(engine_id, merger))
        })
        .ok()
        .flatten()
}
