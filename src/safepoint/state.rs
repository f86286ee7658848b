//! Per-worker safepoint record and the coordinator's stable-read probe.
//!
//! The record is written from both sides of the protocol: the worker
//! publishes the generation it is blocking for (release) and its execution
//! mode; the coordinator flips `running`/`safe` when it accounts the worker.
//! `running` and `safe` are distinct fields updated in distinct steps so a
//! torn read shows up as `running == safe`, which the coordinator treats as
//! unstable and retries.

use crate::ordering::{load_acquire_u64, store_release_u64};
use crate::thread::{ExecutionMode, WorkerThread};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

/// Generation value meaning "not blocked in any safepoint".
pub(crate) const INACTIVE_GENERATION: u64 = 0;

/// Per-worker safepoint bookkeeping. One per [`WorkerThread`].
#[derive(Debug)]
pub(crate) struct SafepointState {
    /// True while the coordinator is still waiting for this worker.
    running: AtomicBool,
    /// Complement of `running`, written in a separate step.
    safe: AtomicBool,
    /// The generation this worker has acknowledged; `0` when not blocked.
    observed_generation: AtomicU64,
    /// Execution mode sampled by the coordinator when it classified the
    /// worker, for timeout reports.
    origin_mode: AtomicU8,
    /// True while the worker is inside the explicit poll handler.
    at_poll: AtomicBool,
}

impl SafepointState {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            safe: AtomicBool::new(false),
            observed_generation: AtomicU64::new(INACTIVE_GENERATION),
            origin_mode: AtomicU8::new(ExecutionMode::InUserCode as u8),
            at_poll: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn is_safe(&self) -> bool {
        self.safe.load(Ordering::Acquire)
    }

    pub(crate) fn observed_generation(&self) -> u64 {
        load_acquire_u64(&self.observed_generation)
    }

    pub(crate) fn set_observed_generation(&self, generation: u64) {
        store_release_u64(&self.observed_generation, generation);
    }

    pub(crate) fn set_at_poll(&self, at_poll: bool) {
        self.at_poll.store(at_poll, Ordering::Release);
    }

    pub(crate) fn is_at_poll(&self) -> bool {
        self.at_poll.load(Ordering::Acquire)
    }

    pub(crate) fn record_origin_mode(&self, mode: ExecutionMode) {
        self.origin_mode.store(mode as u8, Ordering::Release);
    }

    pub(crate) fn origin_mode(&self) -> ExecutionMode {
        ExecutionMode::from_u8(self.origin_mode.load(Ordering::Acquire))
    }

    /// Account the worker safe. `safe` is set after `running` is cleared so
    /// the two never read true together.
    pub(crate) fn account_safe(&self) {
        debug_assert!(!self.is_safe(), "must be unsafe before safe");
        self.running.store(false, Ordering::Release);
        self.safe.store(true, Ordering::Release);
    }

    /// Reset to running on safepoint exit.
    pub(crate) fn restart(&self) {
        debug_assert!(self.is_safe(), "must be safe before unsafe");
        self.safe.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
    }
}

/// Result of one examination pass over a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classification {
    /// The worker cannot run user code until it passes a poll; account it.
    Safe,
    /// The worker is (or may be) running user code; poll it again.
    StillRunning,
}

/// Double-checked stable read of a worker's execution mode.
///
/// Reads the mode, acquire-loads the observed generation, and re-reads the
/// mode. If the two mode reads differ, or the observed generation belongs
/// to a different safepoint than `safepoint_generation` (and is not
/// inactive), the read is torn and `None` is returned; the caller's loop
/// retries. Pass [`INACTIVE_GENERATION`] when probing outside an active
/// safepoint.
///
/// The acquire load in the middle pairs with the worker's release store of
/// the observed generation in the block protocol: a worker that looped
/// around from a previous safepoint changes its mode away from `Blocked`
/// before resetting the generation to zero, so the second mode read is
/// guaranteed to be post-reset.
pub(crate) fn try_stable_mode(
    worker: &WorkerThread,
    safepoint_generation: u64,
) -> Option<ExecutionMode> {
    let first = worker.mode();
    let observed = worker.safepoint_state().observed_generation();
    let second = worker.mode();

    if first != second {
        return None;
    }
    if observed != INACTIVE_GENERATION && observed != safepoint_generation {
        // Still wearing an old safepoint's generation; not stable yet.
        return None;
    }
    Some(first)
}

/// Whether `mode` is a safepoint-safe execution mode for `worker`.
pub(crate) fn safe_with(worker: &WorkerThread, mode: ExecutionMode) -> bool {
    match mode {
        // A privileged call cannot run user code until it returns, and the
        // return path checks the poll. Only safe once the activation record
        // is walkable.
        ExecutionMode::InPrivilegedCall => worker.is_walkable(),
        // On the wait barrier, a lock, or a monitor wait.
        ExecutionMode::Blocked => true,
        ExecutionMode::Terminated | ExecutionMode::Suspended => true,
        ExecutionMode::InUserCode | ExecutionMode::InTransition => false,
    }
}

/// One examination of a still-running worker, against an active safepoint
/// with generation `safepoint_generation`.
///
/// An unstable read classifies as [`Classification::StillRunning`]; the
/// synchronize loop simply comes around again.
pub(crate) fn examine(worker: &WorkerThread, safepoint_generation: u64) -> Classification {
    debug_assert!(
        worker.safepoint_state().is_running(),
        "examining a worker that is already accounted safe"
    );

    let Some(mode) = try_stable_mode(worker, safepoint_generation) else {
        return Classification::StillRunning;
    };

    worker.safepoint_state().record_origin_mode(mode);

    if safe_with(worker, mode) {
        Classification::Safe
    } else {
        Classification::StillRunning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::WorkerThread;

    #[test]
    fn running_and_safe_are_complements() {
        let state = SafepointState::new();
        assert!(state.is_running());
        assert!(!state.is_safe());

        state.account_safe();
        assert!(!state.is_running());
        assert!(state.is_safe());

        state.restart();
        assert!(state.is_running());
        assert!(!state.is_safe());
    }

    #[test]
    fn user_code_is_not_safe() {
        let worker = WorkerThread::new(1);
        assert_eq!(examine(&worker, 1), Classification::StillRunning);
    }

    #[test]
    fn walkable_privileged_call_is_safe() {
        let worker = WorkerThread::new(2);
        worker.enter_privileged_call();
        assert_eq!(examine(&worker, 1), Classification::Safe);
    }

    #[test]
    fn terminated_worker_is_safe() {
        let worker = WorkerThread::new(3);
        worker.terminate();
        assert_eq!(examine(&worker, 1), Classification::Safe);
    }

    #[test]
    fn stale_generation_is_unstable() {
        let worker = WorkerThread::new(4);
        worker.terminate();
        // Pretend the worker still wears generation 1 while we synchronize
        // generation 3.
        worker.safepoint_state().set_observed_generation(1);
        assert_eq!(try_stable_mode(&worker, 3), None);
        assert_eq!(examine(&worker, 3), Classification::StillRunning);

        worker.safepoint_state().set_observed_generation(3);
        assert_eq!(examine(&worker, 3), Classification::Safe);
    }
}
