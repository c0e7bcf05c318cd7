//! # leak-tracker
//!
//! This crate provides an always-on allocation tracker: it records every live heap and mapped-memory allocation of a
//! running process, attributes each one to a call site and, optionally, a sampled call stack, and produces an
//! aggregated leak report on demand.
//!
//! ## high-level usage
//!
//! `leak-tracker` has three main components:
//! - [`Engine`], the tracker itself: per-thread accumulators, a background merge worker, and the dump path
//! - [`Allocator`], a [`GlobalAlloc`][global_alloc]-compatible allocator that feeds the process-wide engine
//! - [`Tracker`], which owns the process-wide engine and switches tracking on and off at runtime
//!
//! Native interposition shims drive an engine through its per-call-family entry points (such as
//! [`Engine::on_realloc`] or [`Engine::on_mmap`]); Rust programs can instead install [`Allocator`] as their global
//! allocator and call [`Tracker::init`].
//!
//! ## how tracking stays cheap
//!
//! Each thread records acquires and releases into its own accumulator. A release that matches an allocation made
//! on the same thread cancels it locally; anything else is queued as a borrowed free. Full accumulators are handed to
//! the merge worker, which folds them into a shared bucket and periodically repays borrowed frees against records
//! flushed by other threads, using a process-wide sequence clock to tell a free of an old allocation apart from a
//! free of a newer one at the same address. A dump forces a full merge, so its report is consistent.
//!
//! ## examples
//!
//! The `stdout` demo installs the tracking allocator, leaks a few allocations on purpose, and prints the dump.
//!
//! [global_alloc]: std::alloc::GlobalAlloc
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::cargo)]
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};

mod accumulator;
mod allocator;
mod bucket;
mod clock;
mod config;
mod debt;
mod dispatch;
mod engine;
mod error;
mod guard;
mod merge;
mod record;
mod report;
mod stack;
mod stats;
mod symbol;

pub use crate::allocator::Allocator;
pub use crate::config::{TrackerConfig, TrackerConfigBuilder};
pub use crate::dispatch::{PendingRealloc, MAP_FAILED};
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::{ConfigError, DumpError, EngineError, UnwindError};
pub use crate::guard::{untracked, ReentrancyGuard};
pub use crate::record::{
    AddressKey, AllocationRecord, CallerAggregate, FreeRecord, RegionKind, StackAggregate, StackHash, Stamp,
    ThreadKey,
};
pub use crate::report::{
    CallerEntry, CallerGroup, DumpReport, FrameLine, RegionReport, Remainder, SizeBucket, StackEntry, StackGroup,
};
pub use crate::stack::{hash_frames, BacktraceUnwinder, CapturedStack, Sample, Unwinder};
pub use crate::stats::Diagnostics;
pub use crate::symbol::{DlSymbolizer, ModuleInfo, Symbolizer};

/// Whether or not allocations should be tracked.
static TRACKING_ENABLED: AtomicBool = AtomicBool::new(false);

// The process-wide engine fed by `Allocator`.
static GLOBAL_ENGINE: OnceLock<Engine> = OnceLock::new();

/// Owns the process-wide engine used by [`Allocator`].
pub struct Tracker;

impl Tracker {
    /// Sets up the process-wide engine.
    ///
    /// Idempotent: once an engine exists it is returned as is, and a differing `config` is ignored with a warning.
    /// Tracking is enabled right away if [`TrackerConfig::start_enabled`] is set.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the merge worker cannot be started.
    pub fn init(config: TrackerConfig) -> Result<&'static Engine, EngineError> {
        let _untracked = ReentrancyGuard::hold();

        if let Some(engine) = GLOBAL_ENGINE.get() {
            if engine.config() != &config {
                tracing::warn!("tracker already initialized, ignoring new configuration");
            }
            return Ok(engine);
        }

        let start_enabled = config.start_enabled;
        let engine = Engine::new(config)?;

        // If another thread won the race, its engine is kept and ours shuts down here.
        let engine = GLOBAL_ENGINE.get_or_init(move || engine);

        if start_enabled {
            Self::enable_tracking();
        }
        Ok(engine)
    }

    /// The process-wide engine, if [`init`][Tracker::init] has been called.
    pub fn global() -> Option<&'static Engine> {
        GLOBAL_ENGINE.get()
    }

    /// Enables the tracking of allocations.
    pub fn enable_tracking() {
        TRACKING_ENABLED.store(true, Ordering::SeqCst);
    }

    /// Disables the tracking of allocations.
    ///
    /// Already-recorded allocations stay live; releases made while tracking is disabled are not seen, so they will
    /// be reported as leaks.
    pub fn disable_tracking() {
        TRACKING_ENABLED.store(false, Ordering::SeqCst);
    }

    /// Whether allocations are currently being tracked.
    pub fn is_tracking() -> bool {
        TRACKING_ENABLED.load(Ordering::Relaxed)
    }

    /// Runs `f` without tracking the current thread's allocations.
    pub fn untracked<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        untracked(f)
    }

    /// Forwards a module load notification to the process-wide engine.
    pub fn on_module_loaded(name: &str) {
        if let Some(engine) = Self::global() {
            engine.on_module_loaded(name);
        }
    }

    /// Dumps the process-wide engine. See [`Engine::dump`].
    ///
    /// # Errors
    /// Returns an error if the tracker is not initialized or an output file cannot be written.
    pub fn dump(
        include_mmap: bool,
        text_path: Option<&Path>,
        structured_path: Option<&Path>,
    ) -> Result<DumpReport, DumpError> {
        match Self::global() {
            Some(engine) => engine.dump(include_mmap, text_path, structured_path),
            None => Err(DumpError::Uninitialized),
        }
    }
}

#[inline(always)]
fn global_engine() -> Option<&'static Engine> {
    // If tracking isn't enabled, then there's no point returning the engine.
    if !TRACKING_ENABLED.load(Ordering::Relaxed) {
        return None;
    }

    GLOBAL_ENGINE.get()
}
