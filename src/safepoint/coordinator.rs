//! The safepoint coordinator state machine.
//!
//! One thread at a time drives `not synchronized -> synchronizing ->
//! synchronized -> not synchronized`; the registry lock serializes
//! coordinators and pins the worker population for the whole window. The
//! fence placement in `begin` and `end` is the protocol: each step is
//! ordered against the next exactly as documented on the step.

use crate::barrier::WaitBarrier;
use crate::cleanup::CleanupDispatcher;
use crate::error::fatal_error;
use crate::ordering::{full_fence, load_acquire_u64, store_release_bool, store_release_u64};
use crate::safepoint::state::{
    examine, safe_with, try_stable_mode, Classification, INACTIVE_GENERATION,
};
use crate::safepoint::trace::{SafepointEvent, SafepointStats, SafepointTracing};
use crate::thread::{WorkerRegistry, WorkerThread};
use flume::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Global coordination state, as observed by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SafepointPhase {
    /// No safepoint pending; workers run freely.
    NotSynchronized = 0,
    /// The coordinator is waiting for workers to stop.
    Synchronizing = 1,
    /// All workers accounted safe; the quiesced window is open.
    Synchronized = 2,
}

impl SafepointPhase {
    fn from_u8(raw: u8) -> SafepointPhase {
        match raw {
            1 => SafepointPhase::Synchronizing,
            2 => SafepointPhase::Synchronized,
            _ => SafepointPhase::NotSynchronized,
        }
    }
}

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct SafepointConfig {
    /// Deadline for the synchronize loop. `None` disables the check.
    pub sync_timeout: Option<Duration>,
    /// Abort the process when the deadline passes instead of continuing to
    /// spin.
    pub fatal_on_timeout: bool,
    /// Width of the cleanup pool; `1` runs cleanup serially on the
    /// coordinator.
    pub cleanup_workers: usize,
}

impl Default for SafepointConfig {
    fn default() -> Self {
        Self {
            sync_timeout: None,
            fatal_on_timeout: false,
            cleanup_workers: 1,
        }
    }
}

/// Bookkeeping carried from `begin` to the matching `end`.
struct ActiveSafepoint {
    op_type: &'static str,
    workers: Vec<WorkerThread>,
    initial_running: usize,
    iterations: u64,
}

/// The singular driver of the safepoint protocol.
///
/// Constructed once at process start (or per test), exposed through a
/// process-wide handle, and passed to every worker at registration so the
/// block protocol can find its way back without global lookups.
///
/// # Examples
///
/// ```
/// use quiesce::{SafepointConfig, SafepointCoordinator, WorkerThread};
///
/// let coordinator = SafepointCoordinator::new(SafepointConfig::default());
/// let worker = WorkerThread::new(1);
/// worker.enter_privileged_call();
/// coordinator.register_worker(&worker);
///
/// coordinator.begin("resize-tables");
/// assert!(coordinator.is_at_safepoint());
/// coordinator.end();
///
/// coordinator.unregister_worker(&worker);
/// ```
pub struct SafepointCoordinator {
    phase: AtomicU8,
    generation: AtomicU64,
    /// Workers not yet accounted safe. Written only by the coordinator.
    waiting_to_block: AtomicUsize,
    /// Safe workers that held a critical resource, forwarded to the
    /// collector-locker count at synchronization.
    pinned_count: AtomicUsize,
    /// Process-wide poll flag, the page-protection analogue for pollers
    /// that cannot afford a per-worker word.
    global_poll: AtomicBool,
    registry: Arc<WorkerRegistry>,
    barrier: WaitBarrier,
    cleanup: CleanupDispatcher,
    tracing: SafepointTracing,
    config: SafepointConfig,
    active: Mutex<Option<ActiveSafepoint>>,
}

static GLOBAL: OnceLock<Arc<SafepointCoordinator>> = OnceLock::new();

impl SafepointCoordinator {
    pub fn new(config: SafepointConfig) -> Arc<Self> {
        Arc::new(Self {
            phase: AtomicU8::new(SafepointPhase::NotSynchronized as u8),
            generation: AtomicU64::new(INACTIVE_GENERATION),
            waiting_to_block: AtomicUsize::new(0),
            pinned_count: AtomicUsize::new(0),
            global_poll: AtomicBool::new(false),
            registry: Arc::new(WorkerRegistry::new()),
            barrier: WaitBarrier::new(),
            cleanup: CleanupDispatcher::new(),
            tracing: SafepointTracing::new(),
            config,
            active: Mutex::new(None),
        })
    }

    /// The process-wide coordinator, created on first use.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| SafepointCoordinator::new(SafepointConfig::default())))
    }

    // --- registration ---

    /// Register a mutator worker and hand it this coordinator. Blocks
    /// while a safepoint is in progress.
    pub fn register_worker(self: &Arc<Self>, worker: &WorkerThread) {
        worker.attach_coordinator(self);
        self.registry.register(worker.clone());
    }

    /// Unregister a worker. Blocks while a safepoint is in progress, so a
    /// worker can never vanish out of an open quiesced window.
    pub fn unregister_worker(&self, worker: &WorkerThread) {
        self.registry.unregister(worker);
        worker.detach_coordinator();
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    // --- queries ---

    pub fn phase(&self) -> SafepointPhase {
        SafepointPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SafepointPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Current safepoint generation. Odd while a safepoint is active.
    pub fn generation(&self) -> u64 {
        load_acquire_u64(&self.generation)
    }

    pub fn is_synchronizing(&self) -> bool {
        self.phase() == SafepointPhase::Synchronizing
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.phase() == SafepointPhase::Synchronized
    }

    /// Whether the process-wide poll flag is raised.
    pub fn global_poll_armed(&self) -> bool {
        self.global_poll.load(Ordering::Acquire)
    }

    /// Safe workers that held a critical resource this safepoint.
    pub fn critical_holders(&self) -> usize {
        self.pinned_count.load(Ordering::Relaxed)
    }

    pub fn cleanup(&self) -> &CleanupDispatcher {
        &self.cleanup
    }

    /// Whether accumulated cleanup pressure justifies a safepoint.
    pub fn is_cleanup_needed(&self) -> bool {
        self.cleanup.is_cleanup_needed()
    }

    pub(crate) fn barrier(&self) -> &WaitBarrier {
        &self.barrier
    }

    pub(crate) fn generation_word(&self) -> &AtomicU64 {
        &self.generation
    }

    // --- the protocol ---

    /// Roll every worker forward to a safepoint and open the quiesced
    /// window. Blocks until all workers are accounted safe.
    ///
    /// Must be paired with [`end`](Self::end) on the same thread; prefer
    /// [`SafepointScope`] where control flow allows.
    pub fn begin(&self, op_type: &'static str) {
        if self.phase() != SafepointPhase::NotSynchronized {
            // Another operation is already inside a window; the registry
            // lock below will coalesce us behind it.
            self.tracing.note_coalesced();
        }

        // Step 1: the registry lock pins the worker population and
        // serializes coordinators. Held until `end`.
        let workers = self.registry.lock_for_safepoint();

        if self.phase() != SafepointPhase::NotSynchronized {
            fatal_error("safepoint begin with wrong phase");
        }

        // Step 2: counters must be in place before the barrier is armed
        // and the generation published.
        let nof_workers = workers.len();
        self.waiting_to_block.store(nof_workers, Ordering::Relaxed);
        self.pinned_count.store(0, Ordering::Relaxed);

        let generation = self.generation.load(Ordering::Relaxed);
        if generation & 1 != 0 {
            fatal_error("safepoint generation odd outside a safepoint");
        }
        let safepoint_generation = generation + 1;

        self.tracing.begin(safepoint_generation, op_type, nof_workers);

        // Step 3: arm the barrier for the upcoming generation before the
        // generation itself becomes visible, so no worker can read the new
        // generation and find the barrier disarmed.
        self.barrier.arm(safepoint_generation);

        // Step 4: publish the odd generation. Release orders steps 2-3
        // before it.
        store_release_u64(&self.generation, safepoint_generation);
        self.set_phase(SafepointPhase::Synchronizing);

        // Step 5.
        full_fence();

        // Step 6: arm every per-worker poll word. A worker that acquires
        // its armed poll is now guaranteed to see the odd generation.
        for worker in &workers {
            worker.arm_poll();
        }
        full_fence();

        // Step 7: raise the process-wide poll flag for global pollers.
        store_release_bool(&self.global_poll, true);
        full_fence();

        // Step 8: spin until every worker is accounted safe.
        let (initial_running, iterations) =
            self.synchronize_workers(&workers, safepoint_generation);

        if self.waiting_to_block.load(Ordering::Relaxed) != 0 {
            fatal_error("synchronize loop exited with workers still running");
        }

        // Step 9: the window is open.
        self.set_phase(SafepointPhase::Synchronized);
        full_fence();

        let sync_time = self
            .tracing
            .synchronized(safepoint_generation, initial_running, iterations);
        log::debug!(
            target: "safepoint",
            "synchronized in {sync_time:?} ({initial_running} of {nof_workers} initially running, {} critical)",
            self.critical_holders()
        );

        // Step 10: cleanup runs first so a collection scheduled inside the
        // window sees deflated locks and flushed caches.
        self.cleanup
            .run(safepoint_generation, &self.tracing, self.config.cleanup_workers);
        self.tracing.cleanup_done();

        *self.active.lock() = Some(ActiveSafepoint {
            op_type,
            workers,
            initial_running,
            iterations,
        });
    }

    /// Close the quiesced window and release every worker.
    ///
    /// Must be called on the thread that called [`begin`](Self::begin).
    pub fn end(&self) {
        let Some(active) = self.active.lock().take() else {
            fatal_error("safepoint end without matching begin");
        };

        // Step 1: lower the process-wide poll flag.
        store_release_bool(&self.global_poll, false);

        // Step 2: leave the synchronized phase. The fence keeps the phase
        // read in any in-flight assertion from floating above this point.
        full_fence();
        if self.phase() != SafepointPhase::Synchronized {
            fatal_error("safepoint end with wrong phase");
        }
        self.set_phase(SafepointPhase::NotSynchronized);

        // Step 3: publish the even generation.
        let generation = self.generation.load(Ordering::Relaxed);
        if generation & 1 != 1 {
            fatal_error("safepoint generation even inside a safepoint");
        }
        store_release_u64(&self.generation, generation + 1);

        // Step 4: reset per-worker state. Workers released from the
        // barrier must find their polls cleared and their records running.
        full_fence();
        for worker in &active.workers {
            worker.disarm_poll();
            worker.safepoint_state().restart();
        }

        // Step 5: let registration and new safepoints proceed.
        //
        // Safety: paired with the `lock_for_safepoint` in `begin`, on the
        // same thread per this method's contract.
        unsafe {
            self.registry.unlock_after_safepoint();
        }

        // Step 6: wake everyone parked on the barrier. Done after local
        // state is consistent so a woken worker re-reads a clean world.
        self.barrier.disarm();

        self.tracing.end(
            generation,
            active.op_type,
            active.workers.len(),
            active.initial_running,
            active.iterations,
        );
    }

    /// The synchronize loop: walk the still-running workers calling the
    /// stable-read probe, backing off between passes.
    fn synchronize_workers(
        &self,
        workers: &[WorkerThread],
        safepoint_generation: u64,
    ) -> (usize, u64) {
        let mut still_running: Vec<WorkerThread> = workers
            .iter()
            .filter(|worker| !self.try_account_safe(worker, safepoint_generation))
            .cloned()
            .collect();
        let initial_running = still_running.len();

        let start = Instant::now();
        let deadline = self.config.sync_timeout.map(|t| start + t);
        let mut timeout_reported = false;
        let mut iterations = 1u64;

        while !still_running.is_empty() {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline && !timeout_reported {
                    timeout_reported = true;
                    self.report_timeout(safepoint_generation, &still_running);
                }
            }

            still_running.retain(|worker| !self.try_account_safe(worker, safepoint_generation));

            if !still_running.is_empty() {
                back_off(start);
            }
            iterations += 1;
        }

        (initial_running, iterations)
    }

    /// One examination of `worker`; accounts it safe on success.
    fn try_account_safe(&self, worker: &WorkerThread, safepoint_generation: u64) -> bool {
        let record = worker.safepoint_state();
        if !record.is_running() {
            return true;
        }
        match examine(worker, safepoint_generation) {
            Classification::Safe => {
                let waiting = self.waiting_to_block.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(waiting > 0, "accounted more workers safe than exist");
                if worker.in_critical() {
                    self.pinned_count.fetch_add(1, Ordering::Relaxed);
                }
                record.account_safe();
                log::trace!(
                    target: "safepoint",
                    "worker {} safe in {:?} ({} to go)",
                    worker.id(),
                    record.origin_mode(),
                    waiting - 1
                );
                true
            }
            Classification::StillRunning => false,
        }
    }

    /// Timeout report: log every worker that has not reached safety. Fatal
    /// only when configured so; otherwise the loop keeps spinning.
    fn report_timeout(&self, safepoint_generation: u64, still_running: &[WorkerThread]) {
        log::warn!(
            target: "safepoint",
            "timed out while spinning to reach a safepoint ({} workers still running)",
            still_running.len()
        );
        for worker in still_running {
            log::warn!(
                target: "safepoint",
                "# worker {} in {:?} has not reached the safepoint",
                worker.id(),
                worker.mode()
            );
        }
        self.tracing.timeout(
            safepoint_generation,
            still_running.iter().map(|w| w.id()).collect(),
        );
        if self.config.fatal_on_timeout {
            fatal_error("safepoint synchronization timed out");
        }
    }

    // --- handshake query ---

    /// Whether `worker` is currently in a stable, safepoint-safe mode.
    ///
    /// Usable outside an active safepoint (for per-worker handshakes): the
    /// probe expects the inactive generation on the worker.
    pub fn handshake_safe(&self, worker: &WorkerThread) -> bool {
        if worker.is_terminated() {
            return true;
        }
        match try_stable_mode(worker, INACTIVE_GENERATION) {
            Some(mode) => safe_with(worker, mode),
            None => false,
        }
    }

    // --- diagnostics ---

    pub fn max_sync_time(&self) -> Duration {
        self.tracing.max_sync_time()
    }

    pub fn max_op_time(&self) -> Duration {
        self.tracing.max_op_time()
    }

    pub fn op_count(&self, op_type: &str) -> u64 {
        self.tracing.op_count(op_type)
    }

    pub fn coalesced_ops(&self) -> u64 {
        self.tracing.coalesced()
    }

    pub fn last_stats(&self) -> Option<Arc<SafepointStats>> {
        self.tracing.last_stats()
    }

    /// Subscribe to the diagnostic event bus.
    pub fn events(&self) -> Receiver<SafepointEvent> {
        self.tracing.events()
    }
}

/// Back-off between synchronize passes: fine-grained sleeps until a
/// millisecond has passed, then plain millisecond sleeps. The transition
/// point trades coordinator CPU for worker tail latency.
fn back_off(start: Instant) {
    if start.elapsed() < Duration::from_millis(1) {
        std::thread::sleep(Duration::from_micros(10));
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// RAII safepoint: `begin` on construction, `end` on drop.
///
/// # Examples
///
/// ```
/// use quiesce::{SafepointConfig, SafepointCoordinator, SafepointScope};
///
/// let coordinator = SafepointCoordinator::new(SafepointConfig::default());
/// {
///     let _scope = SafepointScope::new(&coordinator, "tick");
///     assert!(coordinator.is_at_safepoint());
/// }
/// assert!(!coordinator.is_at_safepoint());
/// ```
pub struct SafepointScope<'a> {
    coordinator: &'a SafepointCoordinator,
}

impl<'a> SafepointScope<'a> {
    pub fn new(coordinator: &'a SafepointCoordinator, op_type: &'static str) -> Self {
        coordinator.begin(op_type);
        Self { coordinator }
    }
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        self.coordinator.end();
    }
}
