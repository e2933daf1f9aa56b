use std::sync::Arc;
use std::thread;

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use fclock::raw::spins::Combiner;

// =============================================================================
// Uncontended Benchmarks (Single Thread, Elected Fast Path)
// =============================================================================

fn uncontended_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended");

    // combine: the submitter always finds the queue idle and runs its own
    // operation synchronously.
    group.bench_function("combine_10000", |b| {
        let combiner = Combiner::new(0usize);

        b.iter(|| {
            for _ in 0..10000 {
                combiner.combine(|value| *value += 1);
            }
            black_box(combiner.combine(|value| *value))
        })
    });

    // lock: a raw acquisition and release per iteration, including the heap
    // node allocation.
    group.bench_function("lock_10000", |b| {
        let combiner = Combiner::new(0usize);

        b.iter(|| {
            for _ in 0..10000 {
                *combiner.lock() += 1;
            }
            black_box(combiner.combine(|value| *value))
        })
    });

    // submit + complete: same elected fast path, plus the handle allocation.
    group.bench_function("submit_complete_10000", |b| {
        let combiner = Combiner::new(0usize);

        b.iter(|| {
            for _ in 0..10000 {
                combiner.submit(|value| *value += 1).complete();
            }
            black_box(combiner.combine(|value| *value))
        })
    });

    group.finish();
}

// =============================================================================
// Contended Benchmarks (4 Threads)
// =============================================================================

fn contended_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_4_threads");
    // Spawn-heavy iterations are slower; fewer samples keep runs short.
    group.sample_size(20);

    group.bench_function("combine_10000", |b| {
        b.iter(|| {
            let combiner = Arc::new(Combiner::new(0usize));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let combiner = Arc::clone(&combiner);
                    thread::spawn(move || {
                        for _ in 0..2500 {
                            combiner.combine(|value| *value += 1);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(combiner.combine(|value| *value))
        })
    });

    group.bench_function("lock_10000", |b| {
        b.iter(|| {
            let combiner = Arc::new(Combiner::new(0usize));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let combiner = Arc::clone(&combiner);
                    thread::spawn(move || {
                        for _ in 0..2500 {
                            *combiner.lock() += 1;
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(combiner.combine(|value| *value))
        })
    });

    group.finish();
}

// =============================================================================
// Comparison with std::sync::Mutex (Baseline)
// =============================================================================

fn baseline_benchmark(c: &mut Criterion) {
    use std::sync::Mutex;

    let mut group = c.benchmark_group("std_mutex_baseline");
    group.sample_size(20);

    group.bench_function("lock_no_contention_10000", |b| {
        let mutex = Mutex::new(0usize);

        b.iter(|| {
            for _ in 0..10000 {
                let mut guard = mutex.lock().unwrap();
                *guard += 1;
            }
            black_box(*mutex.lock().unwrap())
        })
    });

    group.bench_function("lock_4_threads_contention_10000", |b| {
        b.iter(|| {
            let mutex = Arc::new(Mutex::new(0usize));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let mutex = Arc::clone(&mutex);
                    thread::spawn(move || {
                        for _ in 0..2500 {
                            let mut guard = mutex.lock().unwrap();
                            *guard += 1;
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(*mutex.lock().unwrap())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    uncontended_benchmark,
    contended_benchmark,
    baseline_benchmark,
);
criterion_main!(benches);
