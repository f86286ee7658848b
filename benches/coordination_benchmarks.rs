//! Fast-path microbenchmarks: the poll word load and the uncontended raw
//! monitor, the two operations that sit on worker hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quiesce::{RawMonitorHandle, SafepointConfig, SafepointCoordinator, WorkerThread};

fn bench_pollcheck_fast_path(c: &mut Criterion) {
    let worker = WorkerThread::new(1);

    c.bench_function("pollcheck_unarmed", |b| {
        b.iter(|| {
            black_box(&worker).pollcheck();
        })
    });
}

fn bench_uncontended_monitor(c: &mut Criterion) {
    let monitor = RawMonitorHandle::create("bench");
    let worker = WorkerThread::new(2);

    c.bench_function("raw_monitor_enter_exit", |b| {
        b.iter(|| {
            monitor.enter(black_box(&worker)).unwrap();
            monitor.exit(black_box(&worker)).unwrap();
        })
    });

    c.bench_function("raw_monitor_recursive_reenter", |b| {
        monitor.enter(&worker).unwrap();
        b.iter(|| {
            monitor.enter(black_box(&worker)).unwrap();
            monitor.exit(black_box(&worker)).unwrap();
        });
        monitor.exit(&worker).unwrap();
    });
}

fn bench_empty_safepoint(c: &mut Criterion) {
    let coordinator = SafepointCoordinator::new(SafepointConfig::default());

    c.bench_function("safepoint_no_workers", |b| {
        b.iter(|| {
            coordinator.begin(black_box("bench"));
            coordinator.end();
        })
    });
}

criterion_group!(
    benches,
    bench_pollcheck_fast_path,
    bench_uncontended_monitor,
    bench_empty_safepoint
);
criterion_main!(benches);
