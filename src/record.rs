use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use serde::Serialize;

/// Which family of acquire/release calls produced an allocation.
///
/// Heap and mapped memory are tracked as separate address namespaces: a heap release never retires a mapped-memory
/// record at the same numeric address, and vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    /// malloc-family and operator-new allocations.
    Heap,
    /// mmap-family mappings.
    Mmap,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Heap => f.pad("heap"),
            RegionKind::Mmap => f.pad("mmap"),
        }
    }
}

/// Identity of a tracked allocation: the address within its region namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressKey {
    /// Region namespace.
    pub kind: RegionKind,
    /// Opaque address value. Never dereferenced.
    pub address: usize,
}

impl AddressKey {
    /// Creates a key for `address` in the `kind` namespace.
    pub const fn new(kind: RegionKind, address: usize) -> Self {
        Self { kind, address }
    }
}

/// Position of an event on the process-wide sequence clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Stamp(pub u64);

/// Identifier of a tracked thread, assigned on first use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadKey(pub u64);

/// Hash over a captured frame sequence. Zero means "not sampled".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StackHash(pub u64);

impl StackHash {
    /// The hash carried by allocations without a captured stack.
    pub const NONE: StackHash = StackHash(0);

    /// Whether this hash refers to a captured stack.
    pub fn is_sampled(self) -> bool {
        self.0 != 0
    }
}

/// Key of a stack aggregate: stacks are aggregated per region namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StackKey {
    pub kind: RegionKind,
    pub hash: StackHash,
}

/// One live, tracked allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Address returned by the acquire call.
    pub address: usize,
    /// Requested byte count.
    pub size: usize,
    /// Return address of the call site, or zero when unknown.
    pub caller: usize,
    /// Region namespace.
    pub kind: RegionKind,
    /// Hash of the sampled stack, [`StackHash::NONE`] when not sampled.
    pub stack_hash: StackHash,
    /// Sequence clock value at allocation time.
    pub stamp: Stamp,
    /// Thread that performed the allocation.
    pub thread: ThreadKey,
}

impl AllocationRecord {
    /// Identity key of this record.
    pub fn key(&self) -> AddressKey {
        AddressKey::new(self.kind, self.address)
    }

    pub(crate) fn stack_key(&self) -> Option<StackKey> {
        if self.stack_hash.is_sampled() {
            Some(StackKey {
                kind: self.kind,
                hash: self.stack_hash,
            })
        } else {
            None
        }
    }
}

/// A release whose allocation record was not found on the releasing thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRecord {
    /// Released address.
    pub address: usize,
    /// Region namespace.
    pub kind: RegionKind,
    /// Sequence clock value at release time.
    pub stamp: Stamp,
}

impl FreeRecord {
    /// Identity key of the released address.
    pub fn key(&self) -> AddressKey {
        AddressKey::new(self.kind, self.address)
    }
}

/// All live allocations sharing one sampled call stack.
#[derive(Clone, Debug)]
pub struct StackAggregate {
    /// Hash of `frames`.
    pub hash: StackHash,
    /// Captured return addresses, innermost first.
    pub frames: Arc<[usize]>,
    /// Sum of the sizes of live records carrying `hash`.
    pub total: usize,
    /// Caller of the first allocation that produced this stack.
    pub caller: usize,
}

impl StackAggregate {
    pub(crate) fn new(hash: StackHash, frames: Arc<[usize]>, caller: usize) -> Self {
        Self {
            hash,
            frames,
            total: 0,
            caller,
        }
    }

    /// Adds `size` live bytes.
    pub(crate) fn attach(&mut self, size: usize) {
        self.total = self.total.saturating_add(size);
    }

    /// Removes `size` live bytes, returning `true` once nothing is left.
    pub(crate) fn detach(&mut self, size: usize) -> bool {
        self.total = self.total.saturating_sub(size);
        self.total == 0
    }
}

/// All live allocations attributed to one call site.
#[derive(Clone, Debug, Default)]
pub struct CallerAggregate {
    /// Return address of the call site.
    pub caller: usize,
    /// Addresses of live allocations made from this call site.
    pub addresses: HashSet<usize>,
    /// Sum of live bytes.
    pub total: usize,
    /// Live allocation count keyed by allocation size.
    pub sizes: HashMap<usize, usize>,
}

impl CallerAggregate {
    pub(crate) fn new(caller: usize) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub(crate) fn attach(&mut self, record: &AllocationRecord) {
        if self.addresses.insert(record.address) {
            self.total = self.total.saturating_add(record.size);
            *self.sizes.entry(record.size).or_default() += 1;
        }
    }
}
