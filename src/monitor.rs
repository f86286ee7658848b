//! Raw monitors: recursive locks with wait/notify for diagnostic agents.
//!
//! Raw monitors are entirely distinct from any user-level synchronization.
//! They must interoperate with the safepoint without deadlocking against
//! it, which drives three rules baked into this module:
//!
//! - the single global queue lock is only ever held for short enqueue and
//!   dequeue fragments, never across a park and never across anything that
//!   could reach a safepoint;
//! - a mutator that blocks on a monitor does so in `Blocked` mode, so the
//!   coordinator counts it safe instead of waiting for it;
//! - queue nodes live on the contending thread's stack. The waking thread
//!   extracts the park event out of a node *before* flipping the node's
//!   state, because the state flip is the moment the blocked thread may
//!   return and pop its frame.
//!
//! Handles are validated against a four-byte magic sentinel with a single
//! aligned load; destroying a monitor clears the sentinel, so stale handles
//! from outside callers are detected instead of dereferencing garbage.

use crate::error::{MonitorResult, RawMonitorError};
use crate::ordering::{compiler_barrier, full_fence};
use crate::park::ParkEvent;
use crate::thread::{ExecutionMode, WorkerThread};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sentinel validating that a handle points at a live monitor.
const MONITOR_MAGIC: u32 = 0x514D_4F4E; // "QMON"

/// Owner value meaning "unowned".
const OWNER_NONE: usize = usize::MAX;

/// Queue node states.
const NODE_RUN: u8 = 0;
const NODE_ENTER: u8 = 1;
const NODE_WAIT: u8 = 2;

/// Queue operations for every monitor in the process share this one lock.
/// That is a scalability impediment, but raw monitor contention is rare and
/// the critical sections are short and bounded.
static QUEUE_LOCK: Mutex<()> = Mutex::new(());

/// What ended a monitor wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A notify moved us out of the wait set.
    Notified,
    /// The timeout elapsed (or the wakeup was spurious).
    TimedOut,
}

/// A contender's queue node. Lives on the contending thread's stack; other
/// threads reach it only through raw pointers taken under [`QUEUE_LOCK`].
struct QNode {
    event: Arc<ParkEvent>,
    state: AtomicU8,
    notified: AtomicU8,
    next: AtomicPtr<QNode>,
}

impl QNode {
    fn new(event: Arc<ParkEvent>, state: u8) -> Self {
        Self {
            event,
            state: AtomicU8::new(state),
            notified: AtomicU8::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

struct RawMonitor {
    magic: AtomicU32,
    name: String,
    owner: AtomicUsize,
    recursions: AtomicUsize,
    entry_list: AtomicPtr<QNode>,
    wait_set: AtomicPtr<QNode>,
    waiters: AtomicUsize,
}

impl RawMonitor {
    fn new(name: &str) -> Self {
        Self {
            magic: AtomicU32::new(MONITOR_MAGIC),
            name: name.to_owned(),
            owner: AtomicUsize::new(OWNER_NONE),
            recursions: AtomicUsize::new(0),
            entry_list: AtomicPtr::new(ptr::null_mut()),
            wait_set: AtomicPtr::new(ptr::null_mut()),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Single aligned load against the sentinel.
    fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MONITOR_MAGIC
    }

    fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    fn try_own(&self, token: usize) -> Result<(), usize> {
        self.owner
            .compare_exchange(OWNER_NONE, token, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| current)
    }

    /// Acquire with the contended path. The caller has already put a
    /// mutator into `Blocked` mode.
    fn simple_enter(&self, thread: &WorkerThread) {
        let token = thread.id();

        // Adaptive spin before touching the queue; most critical sections
        // are shorter than a park/unpark round trip.
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.try_own(token).is_ok() {
                return;
            }
            backoff.spin();
        }

        loop {
            if self.try_own(token).is_ok() {
                return;
            }

            let node = QNode::new(Arc::clone(thread.park_event()), NODE_ENTER);
            let node_ptr = &node as *const QNode as *mut QNode;
            node.event.reset();

            {
                let _queue = QUEUE_LOCK.lock();
                node.next.store(self.entry_list.load(Ordering::Relaxed), Ordering::Relaxed);
                self.entry_list.store(node_ptr, Ordering::Relaxed);
                full_fence();
                // The owner may have exited before it could see our node;
                // retry the acquisition while the node is still unlinkable.
                if self.owner() == OWNER_NONE && self.try_own(token).is_ok() {
                    self.entry_list
                        .store(node.next.load(Ordering::Relaxed), Ordering::Relaxed);
                    return;
                }
            }

            while node.state.load(Ordering::Acquire) == NODE_ENTER {
                node.event.park();
            }
            // Lost the race to another contender; `node` was popped and is
            // dead, loop around with a fresh one.
        }
    }

    /// Release, waking at most one contender.
    fn simple_exit(&self, thread: &WorkerThread) {
        debug_assert_eq!(self.owner(), thread.id(), "exit by non-owner");
        self.owner.store(OWNER_NONE, Ordering::Release);
        full_fence();

        if self.entry_list.load(Ordering::Acquire).is_null() {
            return;
        }

        let popped = {
            let _queue = QUEUE_LOCK.lock();
            let head = self.entry_list.load(Ordering::Relaxed);
            if !head.is_null() {
                // Safety: `head` was published under QUEUE_LOCK and its
                // owning thread cannot pop its frame while the node state
                // is still NODE_ENTER.
                let next = unsafe { (*head).next.load(Ordering::Relaxed) };
                self.entry_list.store(next, Ordering::Relaxed);
            }
            head
        };

        if !popped.is_null() {
            // Safety: the node is now unreachable from the list and its
            // thread is parked until the state flip below, so the pointer
            // is valid up to (and only up to) that flip.
            unsafe {
                debug_assert_eq!((*popped).state.load(Ordering::Relaxed), NODE_ENTER);
                // Extract the event before flipping the state: once the
                // state leaves NODE_ENTER the waking thread may return and
                // the node is random stack space.
                let event = Arc::clone(&(*popped).event);
                compiler_barrier();
                (*popped).state.store(NODE_RUN, Ordering::Release);
                full_fence();
                event.unpark();
            }
        }
    }

    /// Re-acquire after a wait, in `Blocked` mode for mutators so the
    /// coordinator can count the thread safe while it queues.
    fn reacquire(&self, thread: &WorkerThread) {
        if thread.is_mutator() {
            let saved = thread.mode();
            thread.set_mode(ExecutionMode::Blocked);
            self.simple_enter(thread);
            thread.set_mode(saved);
        } else {
            self.simple_enter(thread);
        }
    }

    fn enqueue_waiter(&self, node_ptr: *mut QNode) {
        let _queue = QUEUE_LOCK.lock();
        // Safety: the node is owned by the calling thread and outlives the
        // wait (it is dequeued before simple_wait returns).
        unsafe {
            (*node_ptr)
                .next
                .store(self.wait_set.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.wait_set.store(node_ptr, Ordering::Relaxed);
    }

    /// Unlink `node` from the wait set unless a notify already did.
    /// Double-checked: the unlocked state read is safe because the
    /// lock/unlock pairs around every state flip serialize it.
    fn dequeue_waiter(&self, node: &QNode) {
        if node.state.load(Ordering::Acquire) == NODE_WAIT {
            let _queue = QUEUE_LOCK.lock();
            if node.state.load(Ordering::Relaxed) == NODE_WAIT {
                let target = node as *const QNode as *mut QNode;
                let mut prev: *mut QNode = ptr::null_mut();
                let mut cursor = self.wait_set.load(Ordering::Relaxed);
                while !cursor.is_null() && cursor != target {
                    // Safety: wait-set nodes are only unlinked under
                    // QUEUE_LOCK, which we hold.
                    prev = cursor;
                    cursor = unsafe { (*cursor).next.load(Ordering::Relaxed) };
                }
                assert!(!cursor.is_null(), "waiter vanished from wait set");
                let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
                if prev.is_null() {
                    self.wait_set.store(next, Ordering::Relaxed);
                } else {
                    unsafe { (*prev).next.store(next, Ordering::Relaxed) };
                }
                node.state.store(NODE_RUN, Ordering::Release);
            }
        }
        debug_assert_eq!(node.state.load(Ordering::Relaxed), NODE_RUN);
    }

    /// Wake one waiter (or all). Waiters are unparked directly rather than
    /// transferred to the entry list; the woken thread re-contends.
    fn simple_notify(&self, all: bool) {
        if self.wait_set.load(Ordering::Acquire).is_null() {
            return;
        }

        let mut pending: Option<Arc<ParkEvent>> = None;
        {
            let _queue = QUEUE_LOCK.lock();
            loop {
                let head = self.wait_set.load(Ordering::Relaxed);
                if head.is_null() {
                    break;
                }
                // Safety: same lifetime rule as simple_exit; the waiter
                // cannot leave simple_wait until its state flips, and we
                // extract the event before flipping.
                unsafe {
                    self.wait_set
                        .store((*head).next.load(Ordering::Relaxed), Ordering::Relaxed);
                    if let Some(event) = pending.take() {
                        event.unpark();
                    }
                    let event = Arc::clone(&(*head).event);
                    (*head).notified.store(1, Ordering::Relaxed);
                    compiler_barrier();
                    (*head).state.store(NODE_RUN, Ordering::Release);
                    full_fence();
                    pending = Some(event);
                }
                if !all {
                    break;
                }
            }
        }
        if let Some(event) = pending {
            event.unpark();
        }
    }

    /// Release the monitor, park (interruptibly for mutators), reacquire.
    /// Returns `(interrupted, notified)`.
    fn simple_wait(&self, thread: &WorkerThread, millis: u64) -> (bool, bool) {
        debug_assert_eq!(self.owner(), thread.id());
        debug_assert_eq!(self.recursions.load(Ordering::Relaxed), 0);

        let node = QNode::new(Arc::clone(thread.park_event()), NODE_WAIT);
        let node_ptr = &node as *const QNode as *mut QNode;
        self.enqueue_waiter(node_ptr);

        self.simple_exit(thread);
        debug_assert_ne!(self.owner(), thread.id());

        let mut interrupted = false;
        if thread.is_mutator() && thread.is_interrupted(true) {
            interrupted = true;
        } else if thread.is_mutator() {
            let saved = thread.mode();
            thread.set_mode(ExecutionMode::Blocked);
            if millis == 0 {
                node.event.park();
            } else {
                node.event.park_timeout(Duration::from_millis(millis));
            }
            thread.set_mode(saved);
        } else if millis == 0 {
            node.event.park();
        } else {
            node.event.park_timeout(Duration::from_millis(millis));
        }
        if thread.is_mutator() && thread.is_interrupted(true) {
            interrupted = true;
        }

        self.dequeue_waiter(&node);
        let notified = node.notified.load(Ordering::Acquire) != 0;

        self.reacquire(thread);
        debug_assert_eq!(self.owner(), thread.id());
        debug_assert_eq!(self.recursions.load(Ordering::Relaxed), 0);

        (interrupted, notified)
    }
}

/// An owned, cloneable handle to a raw monitor.
///
/// Clones share the monitor. [`destroy`](Self::destroy) invalidates the
/// magic sentinel, after which every clone fails validation with
/// [`RawMonitorError::InvalidHandle`] instead of touching dead state.
///
/// # Examples
///
/// ```
/// use quiesce::{RawMonitorHandle, WorkerThread};
///
/// let agent = WorkerThread::service(100);
/// let monitor = RawMonitorHandle::create("event-lock");
///
/// monitor.enter(&agent).unwrap();
/// monitor.enter(&agent).unwrap(); // recursive
/// monitor.exit(&agent).unwrap();
/// monitor.exit(&agent).unwrap();
///
/// monitor.destroy().unwrap();
/// assert!(monitor.enter(&agent).is_err());
/// ```
#[derive(Clone)]
pub struct RawMonitorHandle {
    monitor: Arc<RawMonitor>,
}

impl RawMonitorHandle {
    /// Create a raw monitor. The name is kept for diagnostics.
    pub fn create(name: &str) -> Self {
        Self {
            monitor: Arc::new(RawMonitor::new(name)),
        }
    }

    /// Invalidate the monitor. Outstanding clones of this handle keep the
    /// memory alive but fail validation from now on.
    pub fn destroy(&self) -> MonitorResult<()> {
        let monitor = self.validated()?;
        monitor.magic.store(0, Ordering::Release);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.monitor.name
    }

    /// Owner worker id, if owned. Diagnostic only; stale by the time the
    /// caller looks at it.
    pub fn owner_id(&self) -> Option<usize> {
        match self.monitor.owner() {
            OWNER_NONE => None,
            id => Some(id),
        }
    }

    /// Current recursion depth. Meaningful only to the owner.
    pub fn recursions(&self) -> usize {
        self.monitor.recursions.load(Ordering::Relaxed)
    }

    /// Number of threads in a `wait` on this monitor.
    pub fn waiters(&self) -> usize {
        self.monitor.waiters.load(Ordering::Relaxed)
    }

    fn validated(&self) -> MonitorResult<&RawMonitor> {
        if self.monitor.is_valid() {
            Ok(&self.monitor)
        } else {
            Err(RawMonitorError::InvalidHandle)
        }
    }

    /// Acquire the monitor, recursively for the owner.
    ///
    /// A mutator cooperates with external suspension: it yields to a
    /// pending suspension before contending, and a suspension that arrives
    /// while it is queued makes it drop the lock, honor the suspension and
    /// re-contend, so a "suspended" thread can never pop up inside the
    /// monitor.
    pub fn enter(&self, thread: &WorkerThread) -> MonitorResult<()> {
        let monitor = self.validated()?;
        let token = thread.id();

        if thread.is_mutator() {
            while thread.is_externally_suspended() {
                thread.honor_suspension();
            }
        }

        match monitor.try_own(token) {
            Ok(()) => {
                debug_assert_eq!(monitor.recursions.load(Ordering::Relaxed), 0);
                return Ok(());
            }
            Err(current) if current == token => {
                monitor.recursions.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(_) => {}
        }

        log::trace!(
            target: "monitor",
            "worker {token} contending on raw monitor \"{}\"",
            monitor.name
        );

        if thread.is_mutator() {
            let saved = thread.mode();
            thread.set_mode(ExecutionMode::Blocked);
            loop {
                monitor.simple_enter(thread);
                if !thread.is_externally_suspended() {
                    break;
                }
                // Suspended while we were queued. Give the lock back
                // before honoring, so the suspender never observes a
                // suspended thread holding the monitor.
                monitor.simple_exit(thread);
                thread.honor_suspension();
            }
            thread.set_mode(saved);
            // The acquisition may have spanned a whole safepoint.
            thread.pollcheck();
        } else {
            monitor.simple_enter(thread);
        }

        debug_assert_eq!(monitor.owner(), token);
        debug_assert_eq!(monitor.recursions.load(Ordering::Relaxed), 0);
        Ok(())
    }

    /// Release one recursion level, or the monitor itself at level zero.
    pub fn exit(&self, thread: &WorkerThread) -> MonitorResult<()> {
        let monitor = self.validated()?;
        if monitor.owner() != thread.id() {
            return Err(RawMonitorError::IllegalState);
        }
        if monitor.recursions.load(Ordering::Relaxed) > 0 {
            monitor.recursions.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }
        monitor.simple_exit(thread);
        Ok(())
    }

    /// Wait for a notify, at most `millis` milliseconds (`0` waits
    /// indefinitely). The monitor is released for the duration and
    /// reacquired before returning, whatever the outcome; recursion depth
    /// is preserved. Spurious returns are permitted.
    pub fn wait(&self, thread: &WorkerThread, millis: u64) -> MonitorResult<WaitOutcome> {
        let monitor = self.validated()?;
        let token = thread.id();
        if monitor.owner() != token {
            return Err(RawMonitorError::IllegalState);
        }

        // Clear stale permits so an old unpark cannot satisfy this wait.
        thread.park_event().reset();
        full_fence();

        let saved_recursions = monitor.recursions.swap(0, Ordering::Relaxed);
        monitor.waiters.fetch_add(1, Ordering::Relaxed);

        let (mut interrupted, notified) = monitor.simple_wait(thread, millis);

        monitor.recursions.store(saved_recursions, Ordering::Relaxed);
        monitor.waiters.fetch_sub(1, Ordering::Relaxed);
        debug_assert_eq!(monitor.owner(), token);

        if thread.is_mutator() {
            // A suspension that landed while we were waiting: relinquish
            // the monitor until resumed, then re-acquire and re-check the
            // interrupt state. Recursion depth goes back to zero for the
            // duration so an unowned monitor never carries a depth.
            while thread.is_externally_suspended() {
                let depth = monitor.recursions.swap(0, Ordering::Relaxed);
                monitor.simple_exit(thread);
                thread.honor_suspension();
                if thread.is_interrupted(true) {
                    interrupted = true;
                }
                monitor.reacquire(thread);
                monitor.recursions.store(depth, Ordering::Relaxed);
            }
            debug_assert_eq!(monitor.owner(), token);
        }

        if interrupted {
            return Err(RawMonitorError::Interrupted);
        }
        Ok(if notified {
            WaitOutcome::Notified
        } else {
            WaitOutcome::TimedOut
        })
    }

    /// Wake one waiter.
    pub fn notify(&self, thread: &WorkerThread) -> MonitorResult<()> {
        let monitor = self.validated()?;
        if monitor.owner() != thread.id() {
            return Err(RawMonitorError::IllegalState);
        }
        monitor.simple_notify(false);
        Ok(())
    }

    /// Wake every waiter.
    pub fn notify_all(&self, thread: &WorkerThread) -> MonitorResult<()> {
        let monitor = self.validated()?;
        if monitor.owner() != thread.id() {
            return Err(RawMonitorError::IllegalState);
        }
        monitor.simple_notify(true);
        Ok(())
    }
}

impl std::fmt::Debug for RawMonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMonitorHandle")
            .field("name", &self.monitor.name)
            .field("valid", &self.monitor.is_valid())
            .field("owner", &self.owner_id())
            .field("recursions", &self.recursions())
            .finish()
    }
}
