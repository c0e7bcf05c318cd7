use std::alloc::{GlobalAlloc, Layout, System};

use crate::{dispatch::PendingRealloc, engine::Engine, global_engine, record::RegionKind};

/// Tracking allocator implementation.
///
/// Wraps another [`GlobalAlloc`] and reports every allocation, reallocation, and deallocation to the global engine
/// set up by [`Tracker::init`][crate::Tracker::init], whenever tracking is enabled. This allocator must be installed
/// via `#[global_allocator]` in order to take effect.
///
/// Rust does not expose the call site of an allocation, so records carry no caller address unless stack capture is
/// enabled, in which case the first captured frame outside the tracker and the allocation shim is used.
pub struct Allocator<A> {
    inner: A,
}

impl<A> Allocator<A> {
    /// Creates a new `Allocator` that wraps another allocator.
    #[must_use]
    pub const fn from_allocator(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

impl Allocator<System> {
    /// Creates a new `Allocator` that wraps the system allocator.
    #[must_use]
    pub const fn system() -> Allocator<System> {
        Self::from_allocator(System)
    }
}

// The hooks below are not generic so the unwinder can recognize them as the point where allocation events enter
// the tracker.

#[inline(never)]
pub(crate) fn track_acquire(address: usize, size: usize) {
    if let Some(engine) = global_engine() {
        engine.record_acquire(0, address, size, RegionKind::Heap);
    }
}

fn track_release(address: usize) {
    if let Some(engine) = global_engine() {
        engine.record_release(address, RegionKind::Heap);
    }
}

fn begin_realloc(address: usize) -> Option<(&'static Engine, PendingRealloc)> {
    global_engine().map(|engine| (engine, engine.begin_realloc(address)))
}

#[inline(never)]
pub(crate) fn finish_realloc(pending: Option<(&'static Engine, PendingRealloc)>, address: usize, size: usize) {
    if let Some((engine, pending)) = pending {
        engine.finish_realloc(pending, 0, address, size);
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        track_acquire(ptr as usize, layout.size());
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        track_acquire(ptr as usize, layout.size());
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Stamped before the old block can be handed out again, as in `dealloc`.
        let pending = begin_realloc(ptr as usize);
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        finish_realloc(pending, new_ptr as usize, new_size);
        new_ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Stamped before the block can be handed out again, so a racing reuse always orders after this release.
        track_release(ptr as usize);
        self.inner.dealloc(ptr, layout);
    }
}
