//! Performance benchmarks for the Spindle scheduler
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Spawn and join cost per coroutine kind
//! - Context switch throughput between yielding coroutines
//! - Stepper round trips through wait
//! - Semaphore hand-off and mailbox throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spindle::{
    join, mbx_alloc, mbx_get, mbx_new, mbx_post, sem_new, sem_p, sem_v, spawn, wait, yield_now,
    Attr, CoroutineType,
};

/// Benchmark: spawn followed by join
fn bench_spawn_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_join");

    group.bench_function("stackful", |b| {
        b.iter(|| {
            let id = spawn("bench", Attr::default(), || black_box(0)).unwrap();
            join(id).unwrap()
        })
    });

    group.bench_function("stackless", |b| {
        b.iter(|| {
            let id = spawn("bench", Attr::stackless(), || black_box(0)).unwrap();
            join(id).unwrap()
        })
    });

    group.finish();
}

/// Benchmark: yields between several runnable coroutines
fn bench_yield_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("yield_ring");
    const ROUNDS: u64 = 1000;

    for &count in &[2usize, 8, 32] {
        group.throughput(Throughput::Elements(ROUNDS * count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let ids: Vec<_> = (0..count)
                    .map(|_| {
                        spawn("ring", Attr::default(), || {
                            for _ in 0..ROUNDS {
                                yield_now(None);
                            }
                            0
                        })
                        .unwrap()
                    })
                    .collect();
                for id in ids {
                    join(id).unwrap();
                }
            })
        });
    }

    group.finish();
}

/// Benchmark: wait round trips to a stepper
fn bench_stepper(c: &mut Criterion) {
    let mut group = c.benchmark_group("stepper");
    const STEPS: u64 = 1000;
    group.throughput(Throughput::Elements(STEPS));

    for (label, stackless) in [("stackful", false), ("stackless", true)] {
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut attr = Attr::stepper();
                if stackless {
                    attr.set_type(CoroutineType::STACKLESS);
                }
                let id = spawn("generator", attr, || {
                    for i in 0..STEPS {
                        yield_now(Some(Box::new(i)));
                    }
                    0
                })
                .unwrap();
                while !wait(id).unwrap().is_dead() {}
                join(id).unwrap()
            })
        });
    }

    group.finish();
}

/// Benchmark: semaphore ping-pong and mailbox transfer
fn bench_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync");
    const ROUNDS: u64 = 1000;
    group.throughput(Throughput::Elements(ROUNDS));

    group.bench_function("semaphore_ping_pong", |b| {
        let ping = sem_new(0).unwrap();
        let pong = sem_new(0).unwrap();
        b.iter(|| {
            let id = spawn("pong", Attr::default(), move || {
                for _ in 0..ROUNDS {
                    sem_p(ping).unwrap();
                    sem_v(pong).unwrap();
                }
                0
            })
            .unwrap();
            for _ in 0..ROUNDS {
                sem_v(ping).unwrap();
                sem_p(pong).unwrap();
            }
            join(id).unwrap()
        })
    });

    group.bench_function("mailbox_transfer", |b| {
        let mbx = mbx_new().unwrap();
        b.iter(|| {
            let id = spawn("producer", Attr::default(), move || {
                for _ in 0..ROUNDS {
                    mbx_post(mbx, mbx_alloc(16).unwrap()).unwrap();
                }
                0
            })
            .unwrap();
            for _ in 0..ROUNDS {
                black_box(mbx_get(mbx).unwrap());
            }
            join(id).unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_spawn_join,
    bench_yield_ring,
    bench_stepper,
    bench_sync,
);

criterion_main!(benches);
