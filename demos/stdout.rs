use leak_tracker::{Allocator, Tracker, TrackerConfig};

use std::{alloc::System, thread};

// This is where we actually set the global allocator to be the shim allocator implementation from `leak_tracker`.
// The allocator is purely a facade: it forwards every allocation and deallocation to the process-wide engine that
// `Tracker::init` sets up, and does nothing while tracking is disabled.
//
// As well, you can see here that we're wrapping the system allocator. If you want, you can construct `Allocator` by
// wrapping another allocator that implements `GlobalAlloc` via `Allocator::from_allocator`.
#[global_allocator]
static GLOBAL: Allocator<System> = Allocator::system();

fn main() {
    // The engine logs merges and dumps through `tracing`. Anything it logs is emitted with tracking suppressed, so
    // the subscriber's own allocations never show up in the report.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // Stack capture is off by default. Here we sample every allocation of at least 64 bytes.
    let config = TrackerConfig::builder()
        .enable_stacktrace(true)
        .sample_size_range(64, 0)
        .top_n(5)
        .build();
    let _ = Tracker::init(config).expect("tracker should start");

    // Allocations freed on the thread that made them cancel out locally.
    for i in 0..1_000 {
        let scratch = format!("scratch buffer #{}", i);
        drop(scratch);
    }

    // Allocations made on one thread and freed on another are reconciled by the merge worker.
    let shared = thread::spawn(|| vec![0u8; 4096]).join().expect("producer panicked");
    drop(shared);

    // And these we leak on purpose.
    let leaked_small: &'static mut [u32] = Box::leak(vec![7u32; 32].into_boxed_slice());
    let leaked_large = Box::leak(Box::new([0u64; 1024]));
    leaked_small[0] = leaked_large.len() as u32;

    let report = Tracker::dump(false, None, None).expect("dump should succeed");
    Tracker::disable_tracking();

    let mut stdout = std::io::stdout().lock();
    report
        .write_text(&mut stdout)
        .expect("stdout should be writable");
}
