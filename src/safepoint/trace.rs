//! Safepoint tracing: phase timestamps, high-water marks, per-operation
//! counts, and the diagnostic event bus.
//!
//! All writes happen on the coordinator thread; diagnostics read the
//! published snapshot through an `ArcSwap` without taking any lock, and can
//! subscribe to the bounded event channel. Events are posted with
//! `try_send` so a slow (or absent) consumer can never stall the
//! coordinator.

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capacity of the diagnostic event channel.
const EVENT_BUS_CAPACITY: usize = 256;

/// All trace timestamps are nanoseconds since this process-wide epoch, so
/// readings from different coordinators line up.
static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A diagnostic event emitted by the coordinator.
#[derive(Debug, Clone)]
pub enum SafepointEvent {
    /// A safepoint began synchronizing.
    Begin {
        generation: u64,
        op_type: &'static str,
        workers: usize,
    },
    /// All workers are accounted safe.
    Synchronized {
        generation: u64,
        initial_running: usize,
        iterations: u64,
        sync_time: Duration,
    },
    /// One cleanup subtask ran to completion.
    CleanupTask {
        generation: u64,
        task: &'static str,
        duration: Duration,
    },
    /// The safepoint ended and workers were released.
    End {
        generation: u64,
        op_type: &'static str,
        total_time: Duration,
    },
    /// The synchronize loop exceeded its deadline.
    Timeout {
        generation: u64,
        still_running: Vec<usize>,
    },
}

/// Snapshot of the most recent completed safepoint.
#[derive(Debug, Clone)]
pub struct SafepointStats {
    pub generation: u64,
    pub op_type: &'static str,
    /// Workers registered when the safepoint began.
    pub total_workers: usize,
    /// Workers that were not already safe when the poll was armed.
    pub initial_running: usize,
    /// Passes of the synchronize loop.
    pub iterations: u64,
    /// Arming until the last worker was accounted safe.
    pub time_to_sync: Duration,
    /// Cleanup dispatcher wall time.
    pub cleanup_time: Duration,
    /// Total time from begin to end.
    pub total_time: Duration,
}

pub(crate) struct SafepointTracing {
    begin_ns: AtomicU64,
    sync_ns: AtomicU64,
    cleanup_ns: AtomicU64,
    last_end_ns: AtomicU64,
    max_sync_time_ns: AtomicU64,
    max_op_time_ns: AtomicU64,
    op_counts: DashMap<&'static str, u64>,
    coalesced: AtomicU64,
    last_stats: ArcSwapOption<SafepointStats>,
    events_tx: Sender<SafepointEvent>,
    events_rx: Receiver<SafepointEvent>,
}

impl SafepointTracing {
    pub(crate) fn new() -> Self {
        let (events_tx, events_rx) = flume::bounded(EVENT_BUS_CAPACITY);
        Self {
            begin_ns: AtomicU64::new(0),
            sync_ns: AtomicU64::new(0),
            cleanup_ns: AtomicU64::new(0),
            last_end_ns: AtomicU64::new(0),
            max_sync_time_ns: AtomicU64::new(0),
            max_op_time_ns: AtomicU64::new(0),
            op_counts: DashMap::new(),
            coalesced: AtomicU64::new(0),
            last_stats: ArcSwapOption::const_empty(),
            events_tx,
            events_rx,
        }
    }

    fn now_ns(&self) -> u64 {
        PROCESS_EPOCH.elapsed().as_nanos() as u64
    }

    fn emit(&self, event: SafepointEvent) {
        let _ = self.events_tx.try_send(event);
    }

    pub(crate) fn begin(&self, generation: u64, op_type: &'static str, workers: usize) {
        *self.op_counts.entry(op_type).or_insert(0) += 1;
        let now = self.now_ns();
        let app_time =
            Duration::from_nanos(now.saturating_sub(self.last_end_ns.load(Ordering::Relaxed)));
        self.begin_ns.store(now, Ordering::Relaxed);
        log::debug!(
            target: "safepoint",
            "synchronization initiated for \"{op_type}\" (generation {generation}, {workers} workers, {app_time:?} since last)"
        );
        self.emit(SafepointEvent::Begin {
            generation,
            op_type,
            workers,
        });
    }

    pub(crate) fn synchronized(
        &self,
        generation: u64,
        initial_running: usize,
        iterations: u64,
    ) -> Duration {
        let now = self.now_ns();
        self.sync_ns.store(now, Ordering::Relaxed);
        let sync_time =
            Duration::from_nanos(now.saturating_sub(self.begin_ns.load(Ordering::Relaxed)));
        self.emit(SafepointEvent::Synchronized {
            generation,
            initial_running,
            iterations,
            sync_time,
        });
        sync_time
    }

    pub(crate) fn cleanup_task(&self, generation: u64, task: &'static str, duration: Duration) {
        log::trace!(target: "safepoint", "cleanup task \"{task}\" took {duration:?}");
        self.emit(SafepointEvent::CleanupTask {
            generation,
            task,
            duration,
        });
    }

    pub(crate) fn cleanup_done(&self) {
        self.cleanup_ns.store(self.now_ns(), Ordering::Relaxed);
    }

    pub(crate) fn end(
        &self,
        generation: u64,
        op_type: &'static str,
        total_workers: usize,
        initial_running: usize,
        iterations: u64,
    ) {
        let end = self.now_ns();
        let begin = self.begin_ns.load(Ordering::Relaxed);
        let sync = self.sync_ns.load(Ordering::Relaxed);
        let cleanup = self.cleanup_ns.load(Ordering::Relaxed);

        let time_to_sync = Duration::from_nanos(sync.saturating_sub(begin));
        let cleanup_time = Duration::from_nanos(cleanup.saturating_sub(sync));
        let total_time = Duration::from_nanos(end.saturating_sub(begin));
        let op_time = Duration::from_nanos(end.saturating_sub(sync));

        self.max_sync_time_ns
            .fetch_max(time_to_sync.as_nanos() as u64, Ordering::Relaxed);
        self.max_op_time_ns
            .fetch_max(op_time.as_nanos() as u64, Ordering::Relaxed);
        self.last_end_ns.store(end, Ordering::Relaxed);

        self.last_stats.store(Some(Arc::new(SafepointStats {
            generation,
            op_type,
            total_workers,
            initial_running,
            iterations,
            time_to_sync,
            cleanup_time,
            total_time,
        })));

        log::info!(
            target: "safepoint",
            "safepoint \"{op_type}\": reaching {:?}, at safepoint {:?}, total {:?}",
            time_to_sync,
            Duration::from_nanos(end.saturating_sub(cleanup)),
            total_time
        );
        self.emit(SafepointEvent::End {
            generation,
            op_type,
            total_time,
        });
    }

    pub(crate) fn timeout(&self, generation: u64, still_running: Vec<usize>) {
        self.emit(SafepointEvent::Timeout {
            generation,
            still_running,
        });
    }

    pub(crate) fn note_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    // --- diagnostic accessors ---

    pub(crate) fn max_sync_time(&self) -> Duration {
        Duration::from_nanos(self.max_sync_time_ns.load(Ordering::Relaxed))
    }

    pub(crate) fn max_op_time(&self) -> Duration {
        Duration::from_nanos(self.max_op_time_ns.load(Ordering::Relaxed))
    }

    pub(crate) fn op_count(&self, op_type: &str) -> u64 {
        self.op_counts.get(op_type).map(|c| *c).unwrap_or(0)
    }

    pub(crate) fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub(crate) fn last_stats(&self) -> Option<Arc<SafepointStats>> {
        self.last_stats.load_full()
    }

    /// A receiver on the event bus. Multiple subscribers share the stream.
    pub(crate) fn events(&self) -> Receiver<SafepointEvent> {
        self.events_rx.clone()
    }
}
