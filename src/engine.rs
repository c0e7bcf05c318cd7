use std::{
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    accumulator::{self, Accumulator},
    allocator,
    bucket::ReleaseClass,
    clock::SequenceClock,
    config::TrackerConfig,
    dispatch::PendingRealloc,
    error::{DumpError, EngineError},
    guard::{current_thread_key, ReentrancyGuard},
    merge::Merger,
    record::{AddressKey, AllocationRecord, FreeRecord, RegionKind, StackHash, Stamp},
    report::{self, DumpReport},
    stack::{BacktraceUnwinder, Sample, StackSampler, Unwinder},
    stats::{Counters, Diagnostics},
    symbol::{DlSymbolizer, Symbolizer},
};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Functions through which an acquire enters the tracker. Stack captures start past the outermost of these.
pub(crate) fn entry_points() -> [usize; 10] {
    [
        Engine::record_acquire as fn(&Engine, usize, usize, usize, RegionKind) as usize,
        Engine::on_alloc as fn(&Engine, usize, usize, usize) as usize,
        Engine::on_calloc as fn(&Engine, usize, usize, usize, usize) as usize,
        Engine::on_posix_memalign as fn(&Engine, usize, i32, usize, usize) as usize,
        Engine::on_realloc as fn(&Engine, usize, usize, usize, usize) as usize,
        Engine::finish_realloc as fn(&Engine, PendingRealloc, usize, usize, usize) as usize,
        Engine::on_mmap as fn(&Engine, usize, usize, usize) as usize,
        Engine::on_mremap as fn(&Engine, usize, usize, usize, usize) as usize,
        allocator::track_acquire as fn(usize, usize) as usize,
        allocator::finish_realloc as fn(Option<(&'static Engine, PendingRealloc)>, usize, usize) as usize,
    ]
}

/// Everything an engine shares between application threads, the merge worker, and the dump path.
struct Core {
    id: u64,
    config: TrackerConfig,
    clock: SequenceClock,
    sampler: StackSampler,
    symbolizer: Arc<dyn Symbolizer>,
    merger: Arc<Merger>,
    counters: Arc<Counters>,
}

impl Core {
    fn acquire(&self, caller: usize, address: usize, size: usize, kind: RegionKind) {
        if address == 0 {
            Counters::bump(&self.counters.invalid_pointers);
            tracing::debug!(caller, size, %kind, "acquire returned a null pointer");
            return;
        }

        let stamp = self.clock.tick();

        // The unwinder runs before the accumulator is touched so the lock is never held across it.
        let stack = match self.sampler.sample(size) {
            Sample::Captured(stack) => Some(stack),
            Sample::Skipped | Sample::Failed => None,
        };
        let caller = match (caller, &stack) {
            (0, Some(stack)) => stack.frames.first().copied().unwrap_or(0),
            _ => caller,
        };

        let record = AllocationRecord {
            address,
            size,
            caller,
            kind,
            stack_hash: stack.as_ref().map_or(StackHash::NONE, |stack| stack.hash),
            stamp,
            thread: current_thread_key(),
        };

        let superseded = self.with_accumulator(|accumulator| accumulator.record_acquire(record, stack.as_ref()));
        if superseded {
            Counters::bump(&self.counters.stale_evictions);
        }
    }

    /// Records a release ordered at `stamp`, which the caller took no later than the moment the block went back to
    /// the allocator.
    fn release(&self, stamp: Stamp, address: usize, kind: RegionKind) {
        if address == 0 {
            Counters::bump(&self.counters.invalid_pointers);
            tracing::debug!(%kind, "release of a null pointer");
            return;
        }

        let key = AddressKey::new(kind, address);

        if self.with_accumulator(|accumulator| accumulator.release_local(key).is_some()) {
            return;
        }

        match self.merger.classify_release(key) {
            ReleaseClass::Flushed(owner) => {
                tracing::trace!(address, owner = owner.0, "release of a flushed record")
            }
            ReleaseClass::Ambiguous => tracing::trace!(address, "release marked dirty"),
        }

        self.with_accumulator(|accumulator| {
            accumulator.borrow(FreeRecord {
                address,
                kind,
                stamp,
            })
        });
    }

    /// Runs `f` against this thread's accumulator, handing it off afterwards if it grew past capacity.
    ///
    /// Once the thread's locals are gone, `f` runs against a one-off accumulator that is handed off immediately.
    fn with_accumulator<R>(&self, f: impl FnOnce(&mut Accumulator) -> R) -> R {
        match accumulator::local_cell(self.id, &self.merger) {
            Some(cell) => {
                let mut accumulator = cell.lock();
                let result = f(&mut *accumulator);
                if accumulator.over_capacity(self.merger.capacity()) {
                    let full = accumulator.take();
                    self.merger.hand_off(full);
                }
                result
            }
            None => {
                let mut orphan = Accumulator::new(current_thread_key());
                let result = f(&mut orphan);
                if !orphan.is_empty() {
                    self.merger.hand_off_orphan(orphan);
                }
                result
            }
        }
    }

    fn diagnostics(&self) -> Diagnostics {
        let (live_pointers, live_stacks, outstanding_frees) = {
            let bucket = self.merger.bucket();
            (bucket.live_len(), bucket.stacks().len(), bucket.outstanding())
        };

        Diagnostics {
            live_pointers,
            live_stacks,
            lost_pointers: Counters::get(&self.counters.lost_pointers),
            invalid_pointers: Counters::get(&self.counters.invalid_pointers),
            stack_captures: self.sampler.attempts(),
            unwind_failures: self.sampler.failures(),
            stale_evictions: Counters::get(&self.counters.stale_evictions),
            dirty_addresses: self.merger.dirty_len(),
            outstanding_frees,
            handoffs: Counters::get(&self.counters.handoffs),
            orphan_handoffs: Counters::get(&self.counters.orphan_handoffs),
            minor_merges: Counters::get(&self.counters.minor_merges),
            full_merges: Counters::get(&self.counters.full_merges),
            stack_mismatches: Counters::get(&self.counters.stack_mismatches),
        }
    }
}

struct EngineHandle {
    core: Arc<Core>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.core.merger.shutdown();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// One allocation tracker instance.
///
/// An engine owns the sequence clock, the stack sampler, the merge worker and its shared bucket. Application threads
/// feed it through [`record_acquire`][Engine::record_acquire] and [`record_release`][Engine::record_release] (or the
/// per-call-family entry points such as [`on_realloc`][Engine::on_realloc]); each thread accumulates its events
/// locally and hands them to the merge worker in batches. [`dump`][Engine::dump] forces a full merge and renders a
/// report.
///
/// Cloning an engine is cheap and yields a handle to the same tracker. The merge worker stops once the last handle
/// is dropped.
#[derive(Clone)]
pub struct Engine {
    handle: Arc<EngineHandle>,
}

impl Engine {
    /// Starts an engine with the default unwinder and symbolizer.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the merge worker cannot be started.
    pub fn new(config: TrackerConfig) -> Result<Engine, EngineError> {
        Self::builder(config).build()
    }

    /// Starts building an engine with custom collaborators.
    pub fn builder(config: TrackerConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            unwinder: None,
            symbolizer: None,
        }
    }

    fn core(&self) -> &Core {
        &self.handle.core
    }

    /// The configuration this engine was started with.
    pub fn config(&self) -> &TrackerConfig {
        &self.core().config
    }

    /// Whether calls of the given region kind are tracked.
    pub fn tracks(&self, kind: RegionKind) -> bool {
        match kind {
            RegionKind::Heap => true,
            RegionKind::Mmap => self.core().config.enable_mmap_tracking,
        }
    }

    /// Records an intercepted acquire.
    ///
    /// `caller` is the return address of the call site, or zero if unknown. A null `address` is counted as an
    /// invalid pointer and otherwise ignored. Calls made while the current thread is already inside the tracker
    /// are ignored.
    #[inline(never)]
    pub fn record_acquire(&self, caller: usize, address: usize, size: usize, kind: RegionKind) {
        if !self.tracks(kind) {
            return;
        }

        if let Some(_guard) = ReentrancyGuard::enter() {
            self.core().acquire(caller, address, size, kind);
        }
    }

    /// Records an intercepted release.
    pub fn record_release(&self, address: usize, kind: RegionKind) {
        if !self.tracks(kind) {
            return;
        }

        if let Some(_guard) = ReentrancyGuard::enter() {
            let core = self.core();
            core.release(core.clock.tick(), address, kind);
        }
    }

    /// Takes the stamp for a release that has not happened yet.
    pub(crate) fn reserve_stamp(&self) -> Stamp {
        self.core().clock.tick()
    }

    /// Records a release at a stamp taken earlier with `reserve_stamp`.
    pub(crate) fn record_release_at(&self, stamp: Stamp, address: usize, kind: RegionKind) {
        if !self.tracks(kind) {
            return;
        }

        if let Some(_guard) = ReentrancyGuard::enter() {
            self.core().release(stamp, address, kind);
        }
    }

    /// Flushes every thread's pending bookkeeping and reconciles cross-thread releases.
    pub fn full_merge(&self) {
        let _untracked = ReentrancyGuard::hold();
        self.core().merger.full_merge();
    }

    /// Every live allocation after a full merge, ordered by region and address.
    pub fn live_allocations(&self) -> Vec<AllocationRecord> {
        let _untracked = ReentrancyGuard::hold();
        self.core().merger.full_merge();

        let mut records = self
            .core()
            .merger
            .bucket()
            .records()
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(|record| (record.kind, record.address));
        records
    }

    /// Current diagnostic totals, without forcing a merge.
    pub fn diagnostics(&self) -> Diagnostics {
        let _untracked = ReentrancyGuard::hold();
        self.core().diagnostics()
    }

    /// Tells the engine a new code module was mapped, so stack capture and symbolization pick it up.
    pub fn on_module_loaded(&self, name: &str) {
        let _untracked = ReentrancyGuard::hold();
        let core = self.core();
        if core.config.enable_stacktrace {
            core.sampler.maps_changed();
        }
        core.symbolizer.modules_changed();
        tracing::debug!(module = name, "module loaded");
    }

    /// Forces a full merge and builds a report from the resulting snapshot.
    pub fn report(&self, include_mmap: bool) -> DumpReport {
        let _untracked = ReentrancyGuard::hold();
        let core = self.core();
        core.merger.full_merge();

        let collected = report::collect(&core.merger, &core.counters, include_mmap);
        let mut diagnostics = core.diagnostics();
        diagnostics.live_pointers = collected.live_pointers;
        diagnostics.live_stacks = collected.live_stacks;
        diagnostics.stack_mismatches = Counters::get(&core.counters.stack_mismatches);

        report::build(collected, core.symbolizer.as_ref(), &core.config, diagnostics)
    }

    /// Forces a full merge and writes the report.
    ///
    /// `text_path` receives the human-readable rendering and `structured_path` the JSON rendering; either may be
    /// omitted. Both are rendered from the same snapshot, which is also returned.
    ///
    /// # Errors
    /// Returns an error if an output file cannot be written. Tracking is unaffected.
    pub fn dump(
        &self,
        include_mmap: bool,
        text_path: Option<&Path>,
        structured_path: Option<&Path>,
    ) -> Result<DumpReport, DumpError> {
        let _untracked = ReentrancyGuard::hold();
        tracing::debug!("memory dump begin");

        let report = self.report(include_mmap);

        if let Some(path) = text_path {
            let mut writer = BufWriter::new(File::create(path)?);
            report.write_text(&mut writer)?;
            writer.flush()?;
        }

        if let Some(path) = structured_path {
            let mut writer = BufWriter::new(File::create(path)?);
            report.write_json(&mut writer)?;
            writer.flush()?;
        }

        tracing::debug!(
            live_pointers = report.diagnostics.live_pointers,
            lost_pointers = report.diagnostics.lost_pointers,
            "memory dump end"
        );
        Ok(report)
    }

    #[cfg(test)]
    pub(crate) fn merger(&self) -> &Merger {
        &self.core().merger
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.core().id)
            .field("config", &self.core().config)
            .field("sampler", &self.core().sampler)
            .finish()
    }
}

/// Builds an [`Engine`] with custom stack unwinding or symbolization.
pub struct EngineBuilder {
    config: TrackerConfig,
    unwinder: Option<Arc<dyn Unwinder>>,
    symbolizer: Option<Arc<dyn Symbolizer>>,
}

impl EngineBuilder {
    /// Replaces the default [`BacktraceUnwinder`].
    #[must_use]
    pub fn unwinder<U>(mut self, unwinder: U) -> Self
    where
        U: Unwinder + 'static,
    {
        self.unwinder = Some(Arc::new(unwinder));
        self
    }

    /// Replaces the default [`DlSymbolizer`].
    #[must_use]
    pub fn symbolizer<S>(mut self, symbolizer: S) -> Self
    where
        S: Symbolizer + 'static,
    {
        self.symbolizer = Some(Arc::new(symbolizer));
        self
    }

    /// Validates the configuration and starts the merge worker.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the merge worker cannot be started.
    pub fn build(self) -> Result<Engine, EngineError> {
        let _untracked = ReentrancyGuard::hold();
        self.config.validate()?;

        let unwinder = self
            .unwinder
            .unwrap_or_else(|| Arc::new(BacktraceUnwinder::default()));
        let symbolizer = self
            .symbolizer
            .unwrap_or_else(|| Arc::new(DlSymbolizer::new()));
        let counters = Arc::new(Counters::default());
        let merger = Arc::new(Merger::new(&self.config, Arc::clone(&counters)));
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);

        let worker = {
            let merger = Arc::clone(&merger);
            thread::Builder::new()
                .name(format!("leak-tracker-merge-{}", id))
                .spawn(move || merger.run())
                .map_err(EngineError::Spawn)?
        };

        let core = Core {
            id,
            sampler: StackSampler::new(&self.config, unwinder),
            config: self.config,
            clock: SequenceClock::new(),
            symbolizer,
            merger,
            counters,
        };
        tracing::debug!(engine = id, "tracking engine started");

        Ok(Engine {
            handle: Arc::new(EngineHandle {
                core: Arc::new(core),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }
}
