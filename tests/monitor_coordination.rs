//! Raw monitor scenarios, including interoperation with the safepoint.

use proptest::prelude::*;
use quiesce::{
    RawMonitorError, RawMonitorHandle, SafepointConfig, SafepointCoordinator, WaitOutcome,
    WorkerThread,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn contended_monitor_survives_a_safepoint() {
    let coordinator = SafepointCoordinator::new(SafepointConfig::default());
    let a = WorkerThread::new(1);
    let b = WorkerThread::new(2);
    coordinator.register_worker(&a);
    coordinator.register_worker(&b);

    let monitor = RawMonitorHandle::create("contended");
    let a_holds = Arc::new(AtomicBool::new(false));
    let release_a = Arc::new(AtomicBool::new(false));
    let b_acquired = Arc::new(AtomicBool::new(false));

    let thread_a = {
        let monitor = monitor.clone();
        let worker = a.clone();
        let a_holds = Arc::clone(&a_holds);
        let release_a = Arc::clone(&release_a);
        std::thread::spawn(move || {
            monitor.enter(&worker).unwrap();
            a_holds.store(true, Ordering::Release);
            while !release_a.load(Ordering::Acquire) {
                worker.pollcheck();
                std::hint::spin_loop();
            }
            monitor.exit(&worker).unwrap();
            // Keep polling so later safepoints cannot hang on us.
            while !worker.is_terminated() {
                worker.pollcheck();
            }
        })
    };

    while !a_holds.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    let thread_b = {
        let monitor = monitor.clone();
        let worker = b.clone();
        let b_acquired = Arc::clone(&b_acquired);
        std::thread::spawn(move || {
            monitor.enter(&worker).unwrap();
            b_acquired.store(true, Ordering::Release);
            monitor.exit(&worker).unwrap();
            while !worker.is_terminated() {
                worker.pollcheck();
            }
        })
    };

    // Wait until B is demonstrably parked on the monitor's entry queue.
    while b.mode() != quiesce::ExecutionMode::Blocked {
        std::thread::yield_now();
    }
    assert!(!b_acquired.load(Ordering::Acquire));

    // A safepoint with A polling and B parked: both must be accounted.
    coordinator.begin("across-monitor");
    coordinator.end();

    // No deadlock: release A, B gets the monitor.
    release_a.store(true, Ordering::Release);
    while !b_acquired.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
    assert_eq!(monitor.owner_id(), None);

    a.terminate();
    b.terminate();
    thread_a.join().unwrap();
    thread_b.join().unwrap();
    coordinator.unregister_worker(&a);
    coordinator.unregister_worker(&b);
}

#[test]
fn two_contenders_both_make_progress() {
    let monitor = RawMonitorHandle::create("ping-pong");
    let acquisitions = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

    crossbeam::scope(|scope| {
        for index in 0..2usize {
            let monitor = monitor.clone();
            let acquisitions = Arc::clone(&acquisitions);
            scope.spawn(move |_| {
                let worker = WorkerThread::new(index + 1);
                for _ in 0..200 {
                    monitor.enter(&worker).unwrap();
                    acquisitions[index].fetch_add(1, Ordering::Relaxed);
                    monitor.exit(&worker).unwrap();
                }
            });
        }
    })
    .unwrap();

    // The queue hand-off may be approximate, but starvation across a full
    // run is a bug.
    assert_eq!(acquisitions[0].load(Ordering::Relaxed), 200);
    assert_eq!(acquisitions[1].load(Ordering::Relaxed), 200);
    assert_eq!(monitor.owner_id(), None);
}

#[test]
fn interrupted_wait_with_timeout_budget_left() {
    let monitor = RawMonitorHandle::create("interrupted");
    let worker = WorkerThread::new(3);

    monitor.enter(&worker).unwrap();
    let result = {
        let monitor_clone = monitor.clone();
        let waiter = worker.clone();
        let handle = std::thread::spawn(move || monitor_clone.wait(&waiter, 10_000));
        while monitor.waiters() == 0 {
            std::thread::yield_now();
        }
        worker.interrupt();
        handle.join().unwrap()
    };

    assert_eq!(result, Err(RawMonitorError::Interrupted));
    // The monitor was reacquired before the error was returned.
    assert_eq!(monitor.owner_id(), Some(3));
    assert_eq!(monitor.recursions(), 0);
    monitor.exit(&worker).unwrap();
}

#[test]
fn wait_releases_the_monitor_for_the_notifier() {
    let monitor = RawMonitorHandle::create("producer-consumer");
    let ready = Arc::new(AtomicBool::new(false));

    let consumer = {
        let monitor = monitor.clone();
        let ready = Arc::clone(&ready);
        std::thread::spawn(move || {
            let worker = WorkerThread::new(4);
            monitor.enter(&worker).unwrap();
            let mut outcome = WaitOutcome::TimedOut;
            while !ready.load(Ordering::Acquire) {
                outcome = monitor.wait(&worker, 0).unwrap();
            }
            monitor.exit(&worker).unwrap();
            outcome
        })
    };

    while monitor.waiters() == 0 {
        std::thread::yield_now();
    }

    let producer = WorkerThread::new(5);
    monitor.enter(&producer).unwrap();
    ready.store(true, Ordering::Release);
    monitor.notify(&producer).unwrap();
    monitor.exit(&producer).unwrap();

    assert_eq!(consumer.join().unwrap(), WaitOutcome::Notified);
}

#[test]
fn suspension_defers_monitor_entry() {
    let monitor = RawMonitorHandle::create("suspended-entry");
    let worker = WorkerThread::new(6);
    let acquired = Arc::new(AtomicBool::new(false));

    worker.suspend();
    let contender = {
        let monitor = monitor.clone();
        let worker = worker.clone();
        let acquired = Arc::clone(&acquired);
        std::thread::spawn(move || {
            monitor.enter(&worker).unwrap();
            acquired.store(true, Ordering::Release);
            monitor.exit(&worker).unwrap();
        })
    };

    // While suspended, the worker must not enter even an uncontended
    // monitor.
    std::thread::sleep(Duration::from_millis(20));
    assert!(!acquired.load(Ordering::Acquire));

    worker.resume();
    contender.join().unwrap();
    assert!(acquired.load(Ordering::Acquire));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant: for any `enter^k; exit^k`, ownership is held at every
    /// intermediate step and dropped exactly at the end.
    #[test]
    fn recursion_parity(depth in 1usize..12) {
        let monitor = RawMonitorHandle::create("parity");
        let worker = WorkerThread::new(40);

        for level in 0..depth {
            monitor.enter(&worker).unwrap();
            prop_assert_eq!(monitor.recursions(), level);
        }
        for _ in 0..depth - 1 {
            monitor.exit(&worker).unwrap();
            prop_assert_eq!(monitor.owner_id(), Some(40));
        }
        monitor.exit(&worker).unwrap();
        prop_assert_eq!(monitor.owner_id(), None);
        prop_assert_eq!(monitor.recursions(), 0);
    }

    /// Recursion depth survives an interleaved timed wait.
    #[test]
    fn recursion_survives_wait(depth in 1usize..6) {
        let monitor = RawMonitorHandle::create("wait-depth");
        let worker = WorkerThread::new(41);

        for _ in 0..depth {
            monitor.enter(&worker).unwrap();
        }
        let outcome = monitor.wait(&worker, 5).unwrap();
        prop_assert_eq!(outcome, WaitOutcome::TimedOut);
        prop_assert_eq!(monitor.recursions(), depth - 1);

        for _ in 0..depth {
            monitor.exit(&worker).unwrap();
        }
        prop_assert_eq!(monitor.owner_id(), None);
    }
}
