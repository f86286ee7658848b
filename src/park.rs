//! Per-thread park/unpark event.
//!
//! A `ParkEvent` is the blocking primitive underneath both the wait barrier
//! and the raw monitor queues. Each worker owns exactly one event for its
//! whole lifetime; waking a thread always goes through its event, never
//! through the data structure it is queued on. That rule is what lets queue
//! nodes live on the waiter's stack (see the raw monitor): the waker clones
//! the event out of the node before publishing the wakeup and never touches
//! the node again.
//!
//! Unpark is idempotent: it deposits a single permit, and a later park
//! consumes it without blocking. Spurious returns from `park_timeout` are
//! permitted; callers re-check their condition in a loop.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a timed park.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    /// The permit was consumed (unpark happened before or during the wait).
    Unparked,
    /// The timeout elapsed without an unpark.
    TimedOut,
}

/// A one-permit blocking event owned by a single thread.
///
/// # Examples
///
/// ```
/// use quiesce::park::ParkEvent;
/// use std::sync::Arc;
///
/// let event = Arc::new(ParkEvent::new());
/// let remote = Arc::clone(&event);
/// let waiter = std::thread::spawn(move || remote.park());
/// event.unpark();
/// waiter.join().unwrap();
/// ```
#[derive(Debug, Default)]
pub struct ParkEvent {
    permit: Mutex<bool>,
    wakeup: Condvar,
}

impl ParkEvent {
    pub fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Clear any stored permit.
    ///
    /// Called before enqueueing on a monitor or barrier so a permit left
    /// over from an earlier wakeup cannot satisfy the upcoming park.
    pub fn reset(&self) {
        *self.permit.lock() = false;
    }

    /// Block until a permit is available, then consume it.
    pub fn park(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.wakeup.wait(&mut permit);
        }
        *permit = false;
    }

    /// Block until a permit is available or `timeout` elapses.
    pub fn park_timeout(&self, timeout: Duration) -> ParkOutcome {
        let deadline = Instant::now() + timeout;
        let mut permit = self.permit.lock();
        while !*permit {
            if self.wakeup.wait_until(&mut permit, deadline).timed_out() {
                return if *permit {
                    *permit = false;
                    ParkOutcome::Unparked
                } else {
                    ParkOutcome::TimedOut
                };
            }
        }
        *permit = false;
        ParkOutcome::Unparked
    }

    /// Deposit a permit and wake the parked thread, if any.
    ///
    /// Idempotent: at most one permit is stored, so back-to-back unparks
    /// release at most one park.
    pub fn unpark(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.wakeup.notify_one();
    }
}
