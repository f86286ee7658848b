//! Generation-tagged wait barrier.
//!
//! The coordinator arms the barrier with the upcoming safepoint generation
//! before publishing that generation; workers that notice the armed poll
//! park here until the coordinator disarms. Tagging the barrier with the
//! generation protects against stale wakeups: a worker arriving with last
//! cycle's tag returns immediately instead of parking into the next cycle.
//!
//! Ordering: `arm` is a release operation with respect to every store the
//! coordinator made before it, so a worker that observes the armed state
//! also observes the coordinator-side setup. `disarm` is release with
//! respect to the cleanup work performed inside the quiesced window, so a
//! worker returning from `wait` observes every cleanup effect.

use crate::ordering::{cas_u64, full_fence, load_acquire_u64};
use crate::park::ParkEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Tag value meaning "disarmed".
const DISARMED: u64 = 0;

/// A barrier workers park on for the duration of one safepoint.
///
/// # Examples
///
/// ```
/// use quiesce::barrier::WaitBarrier;
/// use quiesce::park::ParkEvent;
/// use std::sync::Arc;
///
/// let barrier = WaitBarrier::new();
/// let event = Arc::new(ParkEvent::new());
///
/// barrier.arm(1);
/// // A wait for a different tag returns immediately.
/// barrier.wait(3, &event);
/// barrier.disarm();
/// // The old tag is stale now, so this does not block either.
/// barrier.wait(1, &event);
/// ```
#[derive(Debug, Default)]
pub struct WaitBarrier {
    tag: AtomicU64,
    waiters: Mutex<Vec<Arc<ParkEvent>>>,
    waiter_count: AtomicUsize,
}

impl WaitBarrier {
    pub fn new() -> Self {
        Self {
            tag: AtomicU64::new(DISARMED),
            waiters: Mutex::new(Vec::new()),
            waiter_count: AtomicUsize::new(0),
        }
    }

    /// Arm the barrier with `tag`. The barrier must be disarmed.
    ///
    /// After this returns, any `wait(tag)` will block until `disarm`.
    pub fn arm(&self, tag: u64) {
        assert_ne!(tag, DISARMED, "cannot arm with the disarmed tag");
        // Release on success orders all prior coordinator stores before the
        // tag becomes visible.
        let armed = cas_u64(&self.tag, DISARMED, tag);
        assert!(armed, "barrier armed while already armed");
    }

    /// Park until the barrier no longer holds `expected`.
    ///
    /// Returns immediately if the tag already differs (stale wakeup
    /// protection). Spurious wakeups re-check the tag and re-park.
    pub fn wait(&self, expected: u64, event: &Arc<ParkEvent>) {
        debug_assert_ne!(expected, DISARMED, "waiting for the disarmed tag");
        if load_acquire_u64(&self.tag) != expected {
            return;
        }

        event.reset();
        {
            let mut waiters = self.waiters.lock();
            // Re-check under the lock: disarm drains the list under the
            // same lock, so either this sees the cleared tag or disarm
            // sees this entry.
            if load_acquire_u64(&self.tag) != expected {
                return;
            }
            waiters.push(Arc::clone(event));
        }
        self.waiter_count.fetch_add(1, Ordering::Relaxed);

        while load_acquire_u64(&self.tag) == expected {
            event.park();
        }

        self.waiter_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Disarm the barrier and release every parked waiter.
    ///
    /// The tag store precedes the wakeups, so a waiter woken here finds the
    /// tag cleared and exits its re-check loop.
    pub fn disarm(&self) {
        let old = self.tag.swap(DISARMED, Ordering::Release);
        assert_ne!(old, DISARMED, "barrier disarmed while not armed");
        full_fence();

        let drained = std::mem::take(&mut *self.waiters.lock());
        for event in drained {
            event.unpark();
        }
    }

    /// Current tag, `0` when disarmed.
    pub fn tag(&self) -> u64 {
        load_acquire_u64(&self.tag)
    }

    /// Number of threads currently parked on the barrier.
    pub fn waiter_count(&self) -> usize {
        self.waiter_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn wait_with_stale_tag_returns_immediately() {
        let barrier = WaitBarrier::new();
        let event = Arc::new(ParkEvent::new());
        barrier.arm(7);
        barrier.wait(5, &event);
        barrier.disarm();
        barrier.wait(7, &event);
    }

    #[test]
    #[should_panic(expected = "already armed")]
    fn double_arm_panics() {
        let barrier = WaitBarrier::new();
        barrier.arm(1);
        barrier.arm(3);
    }

    #[test]
    fn disarm_releases_parked_waiters() {
        let barrier = Arc::new(WaitBarrier::new());
        let released = Arc::new(AtomicBool::new(false));
        barrier.arm(1);

        let (b, r) = (Arc::clone(&barrier), Arc::clone(&released));
        let waiter = std::thread::spawn(move || {
            let event = Arc::new(ParkEvent::new());
            b.wait(1, &event);
            r.store(true, Ordering::Release);
        });

        while barrier.waiter_count() == 0 {
            std::thread::yield_now();
        }
        assert!(!released.load(Ordering::Acquire));

        barrier.disarm();
        waiter.join().unwrap();
        assert!(released.load(Ordering::Acquire));
        assert_eq!(barrier.waiter_count(), 0);
    }

    #[test]
    fn leftover_permit_does_not_break_next_cycle() {
        let barrier = Arc::new(WaitBarrier::new());
        let event = Arc::new(ParkEvent::new());

        // Simulate a stray wakeup permit from an unrelated subsystem.
        event.unpark();

        barrier.arm(1);
        let (b, e) = (Arc::clone(&barrier), Arc::clone(&event));
        let waiter = std::thread::spawn(move || b.wait(1, &e));

        while barrier.waiter_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        barrier.disarm();
        waiter.join().unwrap();
    }
}
