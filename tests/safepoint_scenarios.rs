//! End-to-end safepoint scenarios: workers on real threads, a coordinator
//! driving full begin/end cycles, and the visibility and exclusion
//! guarantees checked from the worker side.

use quiesce::{
    ExecutionMode, SafepointConfig, SafepointCoordinator, SafepointEvent, WorkerThread,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn coordinator() -> Arc<SafepointCoordinator> {
    SafepointCoordinator::new(SafepointConfig::default())
}

#[test]
fn single_worker_in_user_code_is_stopped_and_released() {
    let coordinator = coordinator();
    let worker = WorkerThread::new(1);
    coordinator.register_worker(&worker);

    let stop = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(AtomicUsize::new(0));

    let mutator = {
        let worker = worker.clone();
        let stop = Arc::clone(&stop);
        let progress = Arc::clone(&progress);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                progress.fetch_add(1, Ordering::Relaxed);
                worker.pollcheck();
            }
        })
    };

    assert_eq!(coordinator.generation(), 0);
    coordinator.begin("stop-the-world");
    assert_eq!(coordinator.generation(), 1);

    // Exclusion: the worker makes no progress while the window is open.
    let sampled = progress.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(progress.load(Ordering::Relaxed), sampled);

    coordinator.end();
    assert_eq!(coordinator.generation(), 2);

    // The worker resumes and makes progress again.
    let resumed_from = progress.load(Ordering::Relaxed);
    while progress.load(Ordering::Relaxed) == resumed_from {
        std::thread::yield_now();
    }

    let stats = coordinator.last_stats().expect("stats");
    assert_eq!(stats.initial_running, 1);
    assert_eq!(stats.total_workers, 1);

    stop.store(true, Ordering::Release);
    mutator.join().unwrap();
    coordinator.unregister_worker(&worker);
}

#[test]
fn worker_in_privileged_call_needs_no_rendezvous() {
    let coordinator = coordinator();
    let worker = WorkerThread::new(2);
    coordinator.register_worker(&worker);

    let release = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicBool::new(false));

    let mutator = {
        let worker = worker.clone();
        let release = Arc::clone(&release);
        let entered = Arc::clone(&entered);
        std::thread::spawn(move || {
            worker.enter_privileged_call();
            entered.store(true, Ordering::Release);
            // Simulates a blocking privileged routine.
            while !release.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            worker.leave_privileged_call();
        })
    };

    while !entered.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    coordinator.begin("examine-only");
    coordinator.end();

    let stats = coordinator.last_stats().expect("stats");
    assert_eq!(
        stats.initial_running, 0,
        "a walkable privileged call must be classified safe on the first pass"
    );

    release.store(true, Ordering::Release);
    mutator.join().unwrap();
    coordinator.unregister_worker(&worker);
}

#[test]
fn coordinator_stores_are_visible_to_released_workers() {
    let coordinator = coordinator();
    let worker = WorkerThread::new(3);
    coordinator.register_worker(&worker);

    // Deliberately relaxed: ordering must come from the safepoint protocol
    // (generation release/acquire and barrier disarm), not this cell.
    let payload = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let mutator = {
        let worker = worker.clone();
        let payload = Arc::clone(&payload);
        let observed = Arc::clone(&observed);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                worker.pollcheck();
                // Every read after a block must see the coordinator's
                // pre-disarm store.
                observed.store(payload.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        })
    };

    for round in 1..=10usize {
        coordinator.begin("publish");
        payload.store(round, Ordering::Relaxed);
        coordinator.end();

        // Once the worker demonstrably polled again, it must have observed
        // at least this round's payload.
        let mut latest = observed.load(Ordering::Relaxed);
        while latest < round {
            std::thread::yield_now();
            latest = observed.load(Ordering::Relaxed);
        }
    }

    stop.store(true, Ordering::Release);
    mutator.join().unwrap();
    coordinator.unregister_worker(&worker);
}

#[test]
fn many_workers_synchronize_together() {
    let coordinator = coordinator();
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    let mut workers = Vec::new();

    for id in 1..=8usize {
        let worker = WorkerThread::new(id);
        coordinator.register_worker(&worker);
        workers.push(worker.clone());
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            let mut spins = 0usize;
            while !stop.load(Ordering::Acquire) {
                spins = spins.wrapping_add(1);
                worker.pollcheck();
            }
            spins
        }));
    }

    for _ in 0..5 {
        coordinator.begin("multi");
        for worker in &workers {
            assert_ne!(worker.mode(), ExecutionMode::InUserCode);
        }
        coordinator.end();
    }

    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }
    let stats = coordinator.last_stats().expect("stats");
    assert_eq!(stats.total_workers, 8);
}

#[test]
fn async_notifications_are_deferred_to_safepoint_exit() {
    let coordinator = coordinator();
    let worker = WorkerThread::new(4);
    coordinator.register_worker(&worker);

    let stop = Arc::new(AtomicBool::new(false));
    let mutator = {
        let worker = worker.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                worker.pollcheck();
            }
        })
    };

    worker.post_async_notification();
    assert_eq!(worker.async_delivered(), 0);

    coordinator.begin("deliver-async");
    // Still pending while the worker sits on the barrier.
    assert!(worker.has_pending_async());
    coordinator.end();

    // Delivery happens on the worker's way out of the block protocol.
    while worker.async_delivered() == 0 {
        std::thread::yield_now();
    }
    assert!(!worker.has_pending_async());

    stop.store(true, Ordering::Release);
    mutator.join().unwrap();
    coordinator.unregister_worker(&worker);
}

#[test]
fn transition_edges_suppress_async_delivery() {
    let coordinator = coordinator();
    let worker = WorkerThread::new(5);
    coordinator.register_worker(&worker);

    // The worker only ever polls on privileged-call edges, where async
    // delivery is forbidden.
    let stop = Arc::new(AtomicBool::new(false));
    let mutator = {
        let worker = worker.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                worker.enter_privileged_call();
                worker.leave_privileged_call();
            }
        })
    };

    worker.post_async_notification();
    coordinator.begin("no-async-on-edges");
    coordinator.end();

    // Give the worker time to cross a few edges; the notification must
    // still be pending because every block had a transition origin.
    std::thread::sleep(Duration::from_millis(20));
    assert!(worker.has_pending_async());
    assert_eq!(worker.async_delivered(), 0);

    stop.store(true, Ordering::Release);
    mutator.join().unwrap();
    coordinator.unregister_worker(&worker);
}

#[test]
fn timeout_names_the_offender_and_recovers() {
    let coordinator = SafepointCoordinator::new(SafepointConfig {
        sync_timeout: Some(Duration::from_millis(10)),
        fatal_on_timeout: false,
        cleanup_workers: 1,
    });
    let polite = WorkerThread::new(6);
    let stubborn = WorkerThread::new(7);
    coordinator.register_worker(&polite);
    coordinator.register_worker(&stubborn);

    let stop = Arc::new(AtomicBool::new(false));
    let polite_thread = {
        let worker = polite.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                worker.pollcheck();
            }
        })
    };
    // The stubborn worker never polls; it eventually "blocks" instead.
    let stubborn_thread = {
        let worker = stubborn.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            worker.enter_privileged_call();
            while worker.poll_armed() {
                std::thread::sleep(Duration::from_millis(1));
            }
            worker.leave_privileged_call();
        })
    };

    let events = coordinator.events();
    coordinator.begin("late");
    coordinator.end();

    let named: Vec<usize> = events
        .drain()
        .filter_map(|event| match event {
            SafepointEvent::Timeout { still_running, .. } => Some(still_running),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(named.contains(&7), "timeout must name the stubborn worker");

    // Parity held throughout and the coordinator recovered.
    assert_eq!(coordinator.generation() & 1, 0);

    stop.store(true, Ordering::Release);
    polite_thread.join().unwrap();
    stubborn_thread.join().unwrap();
}
