use std::{
    cell::RefCell,
    collections::{hash_map::DefaultHasher, HashMap},
    ffi::c_void,
    fmt,
    hash::Hasher,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{config::TrackerConfig, engine::entry_points, error::UnwindError, record::StackHash};

/// Innermost frames searched for the point where the allocation entered the tracker.
const ENTRY_SEARCH_DEPTH: usize = 32;

/// Function name prefixes of the tracker itself and of the allocation plumbing between application code and the
/// global allocator.
const PLUMBING_PREFIXES: &[&str] = &[
    "leak_tracker::",
    "<leak_tracker::",
    "backtrace::",
    "<backtrace::",
    "__rust_",
    "__rg_",
    "__rdl_",
    "__rustc::",
    "alloc::",
    "<alloc::",
    "std::alloc::",
    "<std::alloc::",
];

thread_local! {
    static SAMPLING_RNG: RefCell<Option<SmallRng>> = const { RefCell::new(None) };
}

/// Walks the calling thread's stack.
///
/// Implementations return return addresses, innermost first, bounded by `max_depth`. The sampler treats an error or
/// an empty sequence as a failed capture and records the allocation without a stack.
pub trait Unwinder: Send + Sync {
    /// Captures up to `max_depth` return addresses of the current thread.
    fn unwind(&self, max_depth: usize) -> Result<Vec<usize>, UnwindError>;

    /// Called when a new code module has been mapped into the process.
    fn maps_changed(&self) {}
}

/// Default [`Unwinder`] built on the `backtrace` crate.
///
/// Captures start at the first frame outside the tracker. Frames up to the engine entry point the allocation came
/// through are dropped by address, then frames of the tracker and of the Rust allocation plumbing (`alloc`, the
/// `__rust_alloc` shim, [`Allocator`][crate::Allocator]) are dropped by function name. Names are resolved once per
/// function and cached.
#[derive(Debug, Default)]
pub struct BacktraceUnwinder {
    skip: usize,
    plumbing: Mutex<HashMap<usize, bool>>,
}

impl BacktraceUnwinder {
    /// Creates an unwinder that drops the `skip` innermost frames, in addition to the tracker's own.
    pub fn new(skip: usize) -> Self {
        Self {
            skip,
            plumbing: Mutex::new(HashMap::new()),
        }
    }

    fn is_plumbing(&self, ip: usize, function: usize) -> bool {
        let key = if function == 0 { ip } else { function };
        if let Some(known) = self.plumbing.lock().get(&key) {
            return *known;
        }

        // Inlined calls resolve innermost first, so the last name is the function that owns the frame. The lookup
        // uses the call instruction rather than the return address.
        let mut owner = None;
        backtrace::resolve(ip.saturating_sub(1) as *mut c_void, |symbol| {
            if let Some(name) = symbol.name() {
                owner = Some(format!("{:#}", name));
            }
        });

        let plumbing = owner.map_or(false, |name| {
            PLUMBING_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        });
        self.plumbing.lock().insert(key, plumbing);
        plumbing
    }
}

impl Unwinder for BacktraceUnwinder {
    fn unwind(&self, max_depth: usize) -> Result<Vec<usize>, UnwindError> {
        let entry_points = entry_points();
        let limit = max_depth.saturating_add(ENTRY_SEARCH_DEPTH);
        let mut frames = Vec::with_capacity(limit.min(64));
        let mut start = 0;

        backtrace::trace(|frame| {
            let function = frame.symbol_address() as usize;
            if frames.len() < ENTRY_SEARCH_DEPTH && entry_points.contains(&function) {
                start = frames.len() + 1;
            }

            frames.push((frame.ip() as usize, function));
            frames.len() < limit
        });

        while start < frames.len().min(ENTRY_SEARCH_DEPTH) {
            let (ip, function) = frames[start];
            if !self.is_plumbing(ip, function) {
                break;
            }
            start += 1;
        }

        let frames = frames
            .into_iter()
            .skip(start.saturating_add(self.skip))
            .take(max_depth)
            .map(|(ip, _)| ip)
            .collect::<Vec<_>>();

        if frames.is_empty() {
            Err(UnwindError::new("no frames available"))
        } else {
            Ok(frames)
        }
    }
}

/// Outcome of offering one allocation to the sampler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    /// A gate rejected the allocation; the unwinder was not called.
    Skipped,
    /// The unwinder was called and failed or produced nothing.
    Failed,
    /// A stack was captured.
    Captured(CapturedStack),
}

/// A captured frame sequence together with its hash.
#[derive(Clone, PartialEq, Eq)]
pub struct CapturedStack {
    /// Order-sensitive hash of `frames`. Never [`StackHash::NONE`].
    pub hash: StackHash,
    /// Return addresses, innermost first.
    pub frames: Arc<[usize]>,
}

impl fmt::Debug for CapturedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedStack")
            .field("hash", &format_args!("{:#x}", self.hash.0))
            .field("depth", &self.frames.len())
            .finish()
    }
}

/// Hashes a frame sequence.
///
/// SipHash with fixed keys: stable for the life of the process, sensitive to frame order, and never zero so that it
/// cannot collide with [`StackHash::NONE`].
pub fn hash_frames(frames: &[usize]) -> StackHash {
    let mut hasher = DefaultHasher::new();
    hasher.write_usize(frames.len());
    for frame in frames {
        hasher.write_usize(*frame);
    }

    match hasher.finish() {
        0 => StackHash(1),
        hash => StackHash(hash),
    }
}

/// Gates and invokes the unwinder.
pub(crate) struct StackSampler {
    enabled: bool,
    size_min: usize,
    size_max: usize,
    rate: f64,
    max_depth: usize,
    skip: usize,
    unwinder: Arc<dyn Unwinder>,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl StackSampler {
    pub fn new(config: &TrackerConfig, unwinder: Arc<dyn Unwinder>) -> Self {
        Self {
            enabled: config.enable_stacktrace,
            size_min: config.sample_size_min,
            size_max: config.sample_size_max,
            rate: config.sampling_rate,
            max_depth: config.max_stack_depth,
            skip: config.skip_frames,
            unwinder,
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Gates in order: master switch, size window, random draw.
    fn should_unwind(&self, size: usize) -> bool {
        if !self.enabled {
            return false;
        }

        if (self.size_min != 0 && size < self.size_min) || (self.size_max != 0 && size > self.size_max) {
            return false;
        }

        draw_under(self.rate)
    }

    pub fn sample(&self, size: usize) -> Sample {
        if !self.should_unwind(size) {
            return Sample::Skipped;
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let depth = self.max_depth.saturating_add(self.skip);
        match self.unwinder.unwind(depth) {
            Ok(frames) if frames.len() > self.skip => {
                let frames: Arc<[usize]> = Arc::from(&frames[self.skip..]);
                Sample::Captured(CapturedStack {
                    hash: hash_frames(&frames),
                    frames,
                })
            }
            Ok(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Sample::Failed
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(reason = err.reason(), "stack capture failed");
                Sample::Failed
            }
        }
    }

    pub fn maps_changed(&self) {
        self.unwinder.maps_changed();
    }

    /// Unwinder invocations so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Unwinder invocations that produced no usable stack.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for StackSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackSampler")
            .field("enabled", &self.enabled)
            .field("size_min", &self.size_min)
            .field("size_max", &self.size_max)
            .field("rate", &self.rate)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn draw_under(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }

    SAMPLING_RNG
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            let rng = slot.get_or_insert_with(SmallRng::from_entropy);
            rng.gen::<f64>() < rate
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedUnwinder {
        calls: AtomicUsize,
        frames: Option<Vec<usize>>,
    }

    impl FixedUnwinder {
        fn new(frames: Option<Vec<usize>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                frames,
            })
        }
    }

    impl Unwinder for FixedUnwinder {
        fn unwind(&self, max_depth: usize) -> Result<Vec<usize>, UnwindError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.frames {
                Some(frames) => Ok(frames.iter().copied().take(max_depth).collect()),
                None => Err(UnwindError::new("maps not parsed")),
            }
        }
    }

    fn config(rate: f64, min: usize, max: usize) -> TrackerConfig {
        TrackerConfig::builder()
            .enable_stacktrace(true)
            .sampling_rate(rate)
            .sample_size_range(min, max)
            .build()
    }

    #[test]
    fn hash_is_order_sensitive_and_stable() {
        assert_eq!(hash_frames(&[1, 2, 3]), hash_frames(&[1, 2, 3]));
        assert_ne!(hash_frames(&[1, 2, 3]), hash_frames(&[3, 2, 1]));
        assert_ne!(hash_frames(&[1, 2]), hash_frames(&[1, 2, 0]));
        assert!(hash_frames(&[]).is_sampled());
    }

    #[test]
    fn disabled_sampler_never_unwinds() {
        let unwinder = FixedUnwinder::new(Some(vec![1, 2]));
        let mut config = config(1.0, 0, 0);
        config.enable_stacktrace = false;
        let sampler = StackSampler::new(&config, unwinder.clone());

        assert_eq!(sampler.sample(64), Sample::Skipped);
        assert_eq!(unwinder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn size_window_is_inclusive() {
        let unwinder = FixedUnwinder::new(Some(vec![1, 2]));
        let sampler = StackSampler::new(&config(1.0, 16, 64), unwinder.clone());

        assert_eq!(sampler.sample(15), Sample::Skipped);
        assert!(matches!(sampler.sample(16), Sample::Captured(_)));
        assert!(matches!(sampler.sample(64), Sample::Captured(_)));
        assert_eq!(sampler.sample(65), Sample::Skipped);
        assert_eq!(unwinder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_rate_never_unwinds() {
        let unwinder = FixedUnwinder::new(Some(vec![1, 2]));
        let sampler = StackSampler::new(&config(0.0, 0, 0), unwinder.clone());

        for size in 1..1000 {
            assert_eq!(sampler.sample(size), Sample::Skipped);
        }
        assert_eq!(unwinder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sampler.attempts(), 0);
    }

    #[test]
    fn unwind_failure_is_reported_not_fatal() {
        let unwinder = FixedUnwinder::new(None);
        let sampler = StackSampler::new(&config(1.0, 0, 0), unwinder);

        assert_eq!(sampler.sample(8), Sample::Failed);
        assert_eq!(sampler.attempts(), 1);
        assert_eq!(sampler.failures(), 1);
    }

    #[test]
    fn identical_stacks_hash_identically() {
        let unwinder = FixedUnwinder::new(Some(vec![0x10, 0x20, 0x30]));
        let sampler = StackSampler::new(&config(1.0, 0, 0), unwinder);

        let (first, second) = match (sampler.sample(8), sampler.sample(4096)) {
            (Sample::Captured(a), Sample::Captured(b)) => (a, b),
            other => panic!("expected two captures, got {:?}", other),
        };
        assert_eq!(first.hash, second.hash);
        assert_eq!(&*first.frames, &[0x10, 0x20, 0x30]);
    }

    #[test]
    fn skipped_frames_are_trimmed_from_captures() {
        let unwinder = FixedUnwinder::new(Some(vec![0xa, 0xb, 0x10, 0x20]));
        let mut config = config(1.0, 0, 0);
        config.skip_frames = 2;
        let sampler = StackSampler::new(&config, unwinder);

        match sampler.sample(8) {
            Sample::Captured(stack) => assert_eq!(&*stack.frames, &[0x10, 0x20]),
            other => panic!("expected a capture, got {:?}", other),
        }
    }

    #[test]
    fn backtrace_unwinder_captures_current_thread() {
        let frames = BacktraceUnwinder::default()
            .unwind(8)
            .expect("unwinding the test thread should work");
        assert!(!frames.is_empty());
        assert!(frames.len() <= 8);
    }
}
