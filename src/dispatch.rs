//! Per-call-family entry points for an interposition shim.
//!
//! The shim calls the real implementation first and then reports the call here with its arguments and result.
//! Nothing here can fail or change what the intercepted call returns.

use crate::{
    engine::Engine,
    record::{RegionKind, Stamp},
};

/// The value `mmap` and `mremap` return on failure.
pub const MAP_FAILED: usize = usize::MAX;

/// A `realloc` whose release was stamped before the real call ran.
///
/// Created by [`Engine::begin_realloc`] and consumed by [`Engine::finish_realloc`].
#[derive(Debug)]
#[must_use = "a pending realloc records nothing until it is finished"]
pub struct PendingRealloc {
    old: usize,
    stamp: Stamp,
}

impl Engine {
    /// Reports a `malloc`, `aligned_alloc`, `memalign`, `strdup`-family or `new`-family call.
    #[inline(never)]
    pub fn on_alloc(&self, caller: usize, address: usize, size: usize) {
        self.record_acquire(caller, address, size, RegionKind::Heap);
    }

    /// Reports a `calloc` call. The recorded size is `count * item_size`, saturating.
    #[inline(never)]
    pub fn on_calloc(&self, caller: usize, address: usize, count: usize, item_size: usize) {
        self.record_acquire(caller, address, count.saturating_mul(item_size), RegionKind::Heap);
    }

    /// Reports a `posix_memalign` call. Only successful calls are recorded.
    #[inline(never)]
    pub fn on_posix_memalign(&self, caller: usize, ret: i32, address: usize, size: usize) {
        if ret == 0 {
            self.record_acquire(caller, address, size, RegionKind::Heap);
        }
    }

    /// Reports a `realloc` call after the real call returned.
    ///
    /// A null `old` is a plain acquire and a zero `size` is a plain release. A failed resize leaves `old` live and
    /// records nothing. Any other resize, including one that returned the same address, is recorded as a release of
    /// `old` followed by an acquire of `new`.
    ///
    /// If the real call already handed `old` to another thread, that thread's acquire may be stamped before this
    /// release. Shims that can act before the real call should use [`begin_realloc`][Engine::begin_realloc] instead.
    #[inline(never)]
    pub fn on_realloc(&self, caller: usize, old: usize, new: usize, size: usize) {
        let pending = self.begin_realloc(old);
        self.finish_realloc(pending, caller, new, size);
    }

    /// Stamps the release half of a `realloc` of `old`. Call before the real `realloc` runs.
    pub fn begin_realloc(&self, old: usize) -> PendingRealloc {
        PendingRealloc {
            old,
            stamp: self.reserve_stamp(),
        }
    }

    /// Records a `realloc` begun with [`begin_realloc`][Engine::begin_realloc], given what the real call returned.
    ///
    /// Same cases as [`on_realloc`][Engine::on_realloc]. The release of the old block is ordered at the stamp taken
    /// when the call began.
    #[inline(never)]
    pub fn finish_realloc(&self, pending: PendingRealloc, caller: usize, new: usize, size: usize) {
        let PendingRealloc { old, stamp } = pending;
        if old == 0 {
            self.record_acquire(caller, new, size, RegionKind::Heap);
            return;
        }

        if size == 0 {
            self.record_release_at(stamp, old, RegionKind::Heap);
            return;
        }

        if new == 0 {
            return;
        }

        self.record_release_at(stamp, old, RegionKind::Heap);
        self.record_acquire(caller, new, size, RegionKind::Heap);
    }

    /// Reports a `free` or `delete`-family call.
    pub fn on_free(&self, address: usize) {
        self.record_release(address, RegionKind::Heap);
    }

    /// Reports an `mmap` or `mmap64` call. Failed mappings are ignored.
    #[inline(never)]
    pub fn on_mmap(&self, caller: usize, address: usize, length: usize) {
        if address != MAP_FAILED {
            self.record_acquire(caller, address, length, RegionKind::Mmap);
        }
    }

    /// Reports an `mremap` call as an unmap of the old mapping and a map of the new one.
    #[inline(never)]
    pub fn on_mremap(&self, caller: usize, old: usize, new: usize, new_length: usize) {
        if new == MAP_FAILED {
            return;
        }

        self.record_release(old, RegionKind::Mmap);
        self.record_acquire(caller, new, new_length, RegionKind::Mmap);
    }

    /// Reports a `munmap` call.
    pub fn on_munmap(&self, address: usize) {
        self.record_release(address, RegionKind::Mmap);
    }
}
