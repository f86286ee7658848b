//! The worker-side block protocol: the slow path behind the poll.
//!
//! The fast path is a single load of the per-worker poll word inlined at
//! the call site ([`WorkerThread::pollcheck`]); everything here is the
//! out-of-line slow path with a stable entry signature. A worker lands
//! here from an explicit poll or from the forced polls on the edges of
//! privileged-call transitions.
//!
//! The store/fence sequence below is load-bearing. The worker publishes
//! the generation it is blocking for before it publishes the `Blocked`
//! mode, so the coordinator's stable-read probe (which reads mode,
//! generation, mode) can never see `Blocked` with a missing generation
//! from this safepoint.
//!
//! [`WorkerThread::pollcheck`]: crate::thread::WorkerThread::pollcheck

use crate::error::fatal_error;
use crate::ordering::{full_fence, load_acquire_u64};
use crate::safepoint::state::INACTIVE_GENERATION;
use crate::thread::{ExecutionMode, WorkerThread};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Total slow-path entries across all workers, for diagnostics.
static BLOCKS_TOTAL: AtomicUsize = AtomicUsize::new(0);

/// Number of times any worker has taken the block slow path.
pub fn blocks_total() -> usize {
    BLOCKS_TOTAL.load(Ordering::Relaxed)
}

/// Block the calling worker until the current safepoint ends.
///
/// Returns immediately when the poll was stale (no odd generation is
/// published) or the worker has no coordinator attached. Safe to call
/// redundantly; the barrier tag makes stale entries cheap.
#[cold]
pub fn block(worker: &WorkerThread) {
    let Some(coordinator) = worker.coordinator() else {
        return;
    };

    // A terminated worker is accounted safe through its mode and must not
    // touch the barrier; its termination completes after safepoint exit.
    if worker.is_terminated() {
        return;
    }

    let generation = load_acquire_u64(coordinator.generation_word());
    if generation & 1 == 0 {
        // The coordinator already left (or has not yet published) this
        // safepoint; the poll we saw was stale.
        return;
    }

    BLOCKS_TOTAL.fetch_add(1, Ordering::Relaxed);

    let record = worker.safepoint_state();
    record.set_at_poll(true);

    // Step 1: remember where we came from and make the activation record
    // walkable for the duration.
    let origin_mode = worker.mode();
    let was_walkable = worker.is_walkable();
    worker.make_walkable();

    // Step 2: acknowledge the generation (release).
    record.set_observed_generation(generation);

    // Step 3: the generation store must not reorder with the mode store.
    full_fence();

    // Step 4: commit to blocked (release).
    worker.set_mode(ExecutionMode::Blocked);

    // Step 5: park until disarm. Returns immediately if the coordinator
    // has already disarmed this generation.
    coordinator.barrier().wait(generation, worker.park_event());

    // Step 6: the window must be closed by the time the barrier lets us
    // through.
    if coordinator.is_at_safepoint() {
        fatal_error("worker released from barrier inside the quiesced window");
    }

    // Step 7: barrier loads must not sink below the mode restore.
    full_fence();

    // Step 8: restore the saved execution mode (release).
    worker.set_mode(origin_mode);
    if !was_walkable {
        // Leaving the poll handler; user code frames are live again.
        worker.clear_walkable();
    }

    // Step 9: back to the inactive generation (release). Mode is restored
    // first; the coordinator's probe relies on that order on its backedge.
    record.set_observed_generation(INACTIVE_GENERATION);

    // Step 10.
    full_fence();

    record.set_at_poll(false);

    // Step 11: deferred async notifications are delivered here, except on
    // privileged-call edges where async delivery is forbidden.
    if origin_mode != ExecutionMode::InTransition {
        worker.deliver_pending_async();
    }
}
