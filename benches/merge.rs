use std::thread;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use leak_tracker::{Engine, RegionKind, TrackerConfig};

const RECORDS: usize = 10_000;

fn engine() -> Engine {
    let config = TrackerConfig::builder().accumulator_capacity(1024).build();
    Engine::new(config).expect("engine should start")
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("full merge/local records", |b| {
        b.iter_batched(
            || {
                let engine = engine();
                for i in 0..RECORDS {
                    engine.record_acquire(0xc1, 0x1000 + i * 16, 16, RegionKind::Heap);
                }
                engine
            },
            |engine| {
                engine.full_merge();
                engine
            },
            BatchSize::PerIteration,
        );
    });

    c.bench_function("full merge/cross-thread debts", |b| {
        b.iter_batched(
            || {
                let engine = engine();
                for i in 0..RECORDS {
                    engine.record_acquire(0xc1, 0x1000 + i * 16, 16, RegionKind::Heap);
                }
                let releaser = engine.clone();
                thread::spawn(move || {
                    for i in 0..RECORDS {
                        releaser.record_release(0x1000 + i * 16, RegionKind::Heap);
                    }
                })
                .join()
                .expect("releaser panicked");
                engine
            },
            |engine| {
                engine.full_merge();
                engine
            },
            BatchSize::PerIteration,
        );
    });

    c.bench_function("report/live records", |b| {
        let engine = engine();
        for i in 0..RECORDS {
            engine.record_acquire(0xc1 + (i % 64), 0x1000 + i * 16, 16 + (i % 8), RegionKind::Heap);
        }
        b.iter(|| engine.report(false));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
