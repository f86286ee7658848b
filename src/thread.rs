//! Worker threads and the registry the coordinator walks.
//!
//! A [`WorkerThread`] is the per-thread token the runtime hands to code
//! running on that thread: it carries the poll word the inline fast path
//! reads, the execution-mode word the coordinator samples, the owned park
//! event, and the per-worker safepoint record. The token is a cheap clone
//! around a shared inner, so it can be moved into spawned threads and still
//! be observed from the registry.
//!
//! # Examples
//!
//! ```
//! use quiesce::thread::{WorkerRegistry, WorkerThread};
//!
//! let registry = WorkerRegistry::new();
//! let worker = WorkerThread::new(1);
//! registry.register(worker.clone());
//!
//! // Fast path: nothing armed, nothing happens.
//! worker.pollcheck();
//!
//! assert_eq!(registry.iter().len(), 1);
//! registry.unregister(&worker);
//! ```

use crate::park::ParkEvent;
use crate::safepoint::state::SafepointState;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ordering::full_fence;
use crate::safepoint::SafepointCoordinator;

/// Execution mode of a worker, as sampled by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionMode {
    /// Running user code; must be stopped by the poll.
    InUserCode = 0,
    /// Inside a privileged (runtime/native) call.
    InPrivilegedCall = 1,
    /// On an edge between user code and a privileged call.
    InTransition = 2,
    /// Blocked (on the wait barrier, a lock, or a monitor wait).
    Blocked = 3,
    /// The thread has terminated; it will never run user code again.
    Terminated = 4,
    /// Externally suspended by a debugging agent.
    Suspended = 5,
}

impl ExecutionMode {
    pub(crate) fn from_u8(raw: u8) -> ExecutionMode {
        match raw {
            0 => ExecutionMode::InUserCode,
            1 => ExecutionMode::InPrivilegedCall,
            2 => ExecutionMode::InTransition,
            3 => ExecutionMode::Blocked,
            4 => ExecutionMode::Terminated,
            5 => ExecutionMode::Suspended,
            _ => ExecutionMode::InUserCode,
        }
    }
}

/// Whether a thread participates in safepoints as a mutator.
///
/// Service threads (the coordinator itself, diagnostic agents) use raw
/// monitors but are never stopped by a safepoint and skip the
/// suspension-cooperation paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Mutator,
    Service,
}

pub(crate) struct WorkerInner {
    id: usize,
    kind: WorkerKind,
    mode: AtomicU8,
    /// The per-worker poll word. Armed by the coordinator, read on the
    /// inline fast path.
    poll_armed: AtomicBool,
    /// Whether the activation record can be walked without running user
    /// code (maintained by the external frame machinery; here a flag).
    walkable: AtomicBool,
    interrupted: AtomicBool,
    ext_suspended: AtomicBool,
    /// Deferred asynchronous notification, delivered on safepoint exit.
    pending_async: AtomicBool,
    async_delivered: AtomicUsize,
    /// Depth of critical-resource pins (forwarded to the collector-locker
    /// count when the worker is accounted safe).
    pinned_depth: AtomicUsize,
    park_event: Arc<ParkEvent>,
    pub(crate) safepoint: SafepointState,
    coordinator: ArcSwapOption<SafepointCoordinator>,
}

impl WorkerInner {
    fn new(id: usize, kind: WorkerKind) -> Self {
        Self {
            id,
            kind,
            mode: AtomicU8::new(ExecutionMode::InUserCode as u8),
            poll_armed: AtomicBool::new(false),
            walkable: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            ext_suspended: AtomicBool::new(false),
            pending_async: AtomicBool::new(false),
            async_delivered: AtomicUsize::new(0),
            pinned_depth: AtomicUsize::new(0),
            park_event: Arc::new(ParkEvent::new()),
            safepoint: SafepointState::new(),
            coordinator: ArcSwapOption::const_empty(),
        }
    }
}

/// Per-thread token for a thread known to the runtime.
pub struct WorkerThread {
    inner: Arc<WorkerInner>,
}

impl WorkerThread {
    /// Create a mutator worker. `id` must be unique among live workers.
    pub fn new(id: usize) -> Self {
        Self {
            inner: Arc::new(WorkerInner::new(id, WorkerKind::Mutator)),
        }
    }

    /// Create a service thread token (coordinator, diagnostic agent).
    pub fn service(id: usize) -> Self {
        Self {
            inner: Arc::new(WorkerInner::new(id, WorkerKind::Service)),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.inner.kind
    }

    pub fn is_mutator(&self) -> bool {
        self.inner.kind == WorkerKind::Mutator
    }

    /// The worker's current execution mode.
    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::from_u8(self.inner.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_mode(&self, mode: ExecutionMode) {
        self.inner.mode.store(mode as u8, Ordering::Release);
    }

    /// Inline-able safepoint poll: a single load of the per-worker poll
    /// word and a branch to the out-of-line slow path.
    ///
    /// Call this from user-code loops (or via the [`poll_loop!`] family of
    /// macros) often enough to bound the time to the next safepoint.
    ///
    /// [`poll_loop!`]: crate::poll_loop
    #[inline(always)]
    pub fn pollcheck(&self) {
        if self.inner.poll_armed.load(Ordering::Acquire) {
            crate::safepoint::block(self);
        }
    }

    /// Enter a privileged call: user code stops here and the activation
    /// record becomes walkable, so the coordinator can account this worker
    /// safe without waiting for it.
    pub fn enter_privileged_call(&self) {
        debug_assert_eq!(self.mode(), ExecutionMode::InUserCode);
        self.set_mode(ExecutionMode::InTransition);
        full_fence();
        self.pollcheck();
        self.inner.walkable.store(true, Ordering::Release);
        self.set_mode(ExecutionMode::InPrivilegedCall);
    }

    /// Return from a privileged call. The poll is checked on the way back,
    /// so a safepoint that began while the worker was away stops it here
    /// before any user code runs.
    pub fn leave_privileged_call(&self) {
        debug_assert_eq!(self.mode(), ExecutionMode::InPrivilegedCall);
        self.set_mode(ExecutionMode::InTransition);
        full_fence();
        self.pollcheck();
        self.inner.walkable.store(false, Ordering::Release);
        self.set_mode(ExecutionMode::InUserCode);
    }

    /// Mark this worker terminated. A terminated worker is accounted safe
    /// by the coordinator and never reaches the barrier.
    pub fn terminate(&self) {
        self.set_mode(ExecutionMode::Terminated);
    }

    pub fn is_terminated(&self) -> bool {
        self.mode() == ExecutionMode::Terminated
    }

    // --- poll word, coordinator side ---

    pub(crate) fn arm_poll(&self) {
        self.inner.poll_armed.store(true, Ordering::Release);
    }

    pub(crate) fn disarm_poll(&self) {
        self.inner.poll_armed.store(false, Ordering::Release);
    }

    pub fn poll_armed(&self) -> bool {
        self.inner.poll_armed.load(Ordering::Acquire)
    }

    // --- activation record ---

    pub(crate) fn make_walkable(&self) {
        self.inner.walkable.store(true, Ordering::Release);
    }

    pub(crate) fn clear_walkable(&self) {
        self.inner.walkable.store(false, Ordering::Release);
    }

    pub fn is_walkable(&self) -> bool {
        self.inner.walkable.load(Ordering::Acquire)
    }

    // --- interrupts ---

    /// Post an interrupt and wake the thread if it is parked.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.park_event.unpark();
    }

    /// Read the interrupt flag, optionally consuming it.
    pub fn is_interrupted(&self, clear: bool) -> bool {
        if clear {
            self.inner.interrupted.swap(false, Ordering::AcqRel)
        } else {
            self.inner.interrupted.load(Ordering::Acquire)
        }
    }

    // --- external suspension ---

    /// Request external suspension (debugger-style). The worker honors the
    /// request at its next cooperation point.
    pub fn suspend(&self) {
        self.inner.ext_suspended.store(true, Ordering::Release);
    }

    /// Clear the suspension request and wake the worker.
    pub fn resume(&self) {
        self.inner.ext_suspended.store(false, Ordering::Release);
        self.inner.park_event.unpark();
    }

    pub fn is_externally_suspended(&self) -> bool {
        self.inner.ext_suspended.load(Ordering::Acquire)
    }

    /// Park until a pending suspension request is cleared. The worker sits
    /// in `Suspended` mode, which the coordinator classifies as safe.
    pub(crate) fn honor_suspension(&self) {
        let saved = self.mode();
        self.set_mode(ExecutionMode::Suspended);
        while self.is_externally_suspended() {
            self.inner
                .park_event
                .park_timeout(std::time::Duration::from_millis(1));
        }
        self.set_mode(saved);
        // A safepoint may have started (and classified us safe) while we
        // were suspended; stop at it before running anything else.
        self.pollcheck();
    }

    // --- critical-resource pinning ---

    /// Enter a region holding a critical resource. While pinned, the worker
    /// is still safepoint-safe when blocked, but the coordinator forwards
    /// the pin to the collector-locker count.
    pub fn pin(&self) {
        self.inner.pinned_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.inner.pinned_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin without pin");
    }

    pub fn in_critical(&self) -> bool {
        self.inner.pinned_depth.load(Ordering::Acquire) > 0
    }

    // --- deferred async notifications ---

    /// Post an asynchronous notification. Delivery is deferred to the next
    /// safepoint exit, and suppressed entirely on privileged-call edges.
    pub fn post_async_notification(&self) {
        self.inner.pending_async.store(true, Ordering::Release);
    }

    pub fn has_pending_async(&self) -> bool {
        self.inner.pending_async.load(Ordering::Acquire)
    }

    pub(crate) fn deliver_pending_async(&self) {
        if self.inner.pending_async.swap(false, Ordering::AcqRel) {
            self.inner.async_delivered.fetch_add(1, Ordering::Relaxed);
            log::trace!(target: "safepoint", "worker {} delivered deferred async notification", self.id());
        }
    }

    /// Number of async notifications delivered to this worker so far.
    pub fn async_delivered(&self) -> usize {
        self.inner.async_delivered.load(Ordering::Relaxed)
    }

    // --- plumbing ---

    pub(crate) fn park_event(&self) -> &Arc<ParkEvent> {
        &self.inner.park_event
    }

    pub(crate) fn safepoint_state(&self) -> &SafepointState {
        &self.inner.safepoint
    }

    pub(crate) fn attach_coordinator(&self, coordinator: &Arc<SafepointCoordinator>) {
        self.inner.coordinator.store(Some(Arc::clone(coordinator)));
    }

    pub(crate) fn detach_coordinator(&self) {
        self.inner.coordinator.store(None);
    }

    pub(crate) fn coordinator(&self) -> Option<Arc<SafepointCoordinator>> {
        self.inner.coordinator.load_full()
    }
}

impl Clone for WorkerThread {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("mode", &self.mode())
            .finish()
    }
}

/// Registry of all live mutator workers.
///
/// The registry lock is the safepoint serialization point: the coordinator
/// holds it across the entire quiesced window, so registration and
/// unregistration cannot race a safepoint and no second coordinator can
/// start one.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<Vec<WorkerThread>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Add a worker. Blocks while a safepoint is in progress.
    pub fn register(&self, worker: WorkerThread) {
        self.workers.lock().push(worker);
    }

    /// Remove a worker. Blocks while a safepoint is in progress.
    pub fn unregister(&self, worker: &WorkerThread) {
        self.workers.lock().retain(|w| w.id() != worker.id());
    }

    /// Snapshot of the registered workers.
    pub fn iter(&self) -> Vec<WorkerThread> {
        self.workers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the registry for the duration of a safepoint and return the
    /// worker set. The guard is intentionally leaked; the matching
    /// [`unlock_after_safepoint`](Self::unlock_after_safepoint) releases it.
    pub(crate) fn lock_for_safepoint(&self) -> Vec<WorkerThread> {
        let guard = self.workers.lock();
        let snapshot = guard.clone();
        std::mem::forget(guard);
        snapshot
    }

    /// Release the registry lock taken by
    /// [`lock_for_safepoint`](Self::lock_for_safepoint).
    ///
    /// # Safety
    ///
    /// Must be called exactly once per `lock_for_safepoint`, on the same
    /// thread, with no intervening unlock.
    pub(crate) unsafe fn unlock_after_safepoint(&self) {
        self.workers.force_unlock();
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.len())
            .finish()
    }
}
