//! Cleanup tasks that run inside the quiesced window.
//!
//! The task set is closed at build time: a tagged enum plus a dispatch
//! table of function pointers, no trait objects. Every safepoint runs each
//! task exactly once; a per-task claim bit decided by `cas` picks the
//! worker that runs it, whether the dispatcher executes serially on the
//! coordinator or fans out over a rayon pool.
//!
//! Tasks mutate data that workers read without any extra locking; that is
//! sound only because no worker executes during the quiesced window.

use crate::ordering::cas_bool;
use crate::safepoint::trace::SafepointTracing;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Idle-lock backlog above which a periodic cleanup safepoint pays off.
const DEFLATION_PRESSURE_THRESHOLD: usize = 32;

/// The fixed cleanup task set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CleanupTask {
    /// Deflate lock records that fell idle since the last safepoint.
    DeflateIdleLocks = 0,
    /// Flush buffered inline-cache updates.
    UpdateInlineCaches = 1,
    /// Tick the compilation policy.
    CompilationPolicyTick = 2,
    /// Rehash the symbol table if it asked for it.
    RehashSymbolTable = 3,
    /// Rehash the string table if it asked for it.
    RehashStringTable = 4,
    /// Purge unloaded class-loader data.
    PurgeClassLoaders = 5,
    /// Resize the system dictionary if it asked for it.
    ResizeDictionary = 6,
}

impl CleanupTask {
    pub const COUNT: usize = 7;

    pub const ALL: [CleanupTask; CleanupTask::COUNT] = [
        CleanupTask::DeflateIdleLocks,
        CleanupTask::UpdateInlineCaches,
        CleanupTask::CompilationPolicyTick,
        CleanupTask::RehashSymbolTable,
        CleanupTask::RehashStringTable,
        CleanupTask::PurgeClassLoaders,
        CleanupTask::ResizeDictionary,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CleanupTask::DeflateIdleLocks => "deflating idle locks",
            CleanupTask::UpdateInlineCaches => "updating inline caches",
            CleanupTask::CompilationPolicyTick => "compilation policy tick",
            CleanupTask::RehashSymbolTable => "rehashing symbol table",
            CleanupTask::RehashStringTable => "rehashing string table",
            CleanupTask::PurgeClassLoaders => "purging class loaders",
            CleanupTask::ResizeDictionary => "resizing dictionary",
        }
    }
}

type CleanupFn = fn(&CleanupDispatcher);

/// Dispatch table, one entry per task. Closed at build time.
static DISPATCH_TABLE: [(CleanupTask, CleanupFn); CleanupTask::COUNT] = [
    (CleanupTask::DeflateIdleLocks, do_deflate_idle_locks),
    (CleanupTask::UpdateInlineCaches, do_update_inline_caches),
    (CleanupTask::CompilationPolicyTick, do_compilation_policy_tick),
    (CleanupTask::RehashSymbolTable, do_rehash_symbol_table),
    (CleanupTask::RehashStringTable, do_rehash_string_table),
    (CleanupTask::PurgeClassLoaders, do_purge_class_loaders),
    (CleanupTask::ResizeDictionary, do_resize_dictionary),
];

fn do_deflate_idle_locks(dispatcher: &CleanupDispatcher) {
    let deflated = dispatcher.idle_locks.swap(0, Ordering::AcqRel);
    dispatcher
        .deflated_total
        .fetch_add(deflated, Ordering::Relaxed);
}

fn do_update_inline_caches(dispatcher: &CleanupDispatcher) {
    let flushed = dispatcher.pending_ic_updates.swap(0, Ordering::AcqRel);
    dispatcher
        .ic_updates_total
        .fetch_add(flushed, Ordering::Relaxed);
}

fn do_compilation_policy_tick(dispatcher: &CleanupDispatcher) {
    dispatcher.policy_ticks.fetch_add(1, Ordering::Relaxed);
}

fn do_rehash_symbol_table(dispatcher: &CleanupDispatcher) {
    // Conditional task: consumes its claim even when there is nothing to do.
    if dispatcher.needs_symbol_rehash.swap(false, Ordering::AcqRel) {
        dispatcher.symbol_rehashes.fetch_add(1, Ordering::Relaxed);
    }
}

fn do_rehash_string_table(dispatcher: &CleanupDispatcher) {
    if dispatcher.needs_string_rehash.swap(false, Ordering::AcqRel) {
        dispatcher.string_rehashes.fetch_add(1, Ordering::Relaxed);
    }
}

fn do_purge_class_loaders(dispatcher: &CleanupDispatcher) {
    if dispatcher.needs_loader_purge.swap(false, Ordering::AcqRel) {
        dispatcher.loader_purges.fetch_add(1, Ordering::Relaxed);
    }
}

fn do_resize_dictionary(dispatcher: &CleanupDispatcher) {
    if dispatcher.needs_dictionary_resize.swap(false, Ordering::AcqRel) {
        dispatcher.dictionary_resizes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Single-claim bookkeeping for one safepoint's worth of subtasks.
#[derive(Debug, Default)]
pub(crate) struct SubTasksDone {
    claimed: [AtomicBool; CleanupTask::COUNT],
}

impl SubTasksDone {
    fn new() -> Self {
        Self::default()
    }

    /// Claim `task`. Exactly one caller per safepoint wins.
    pub(crate) fn try_claim(&self, task: CleanupTask) -> bool {
        cas_bool(&self.claimed[task as usize], false, true)
    }

    fn all_claimed(&self) -> bool {
        self.claimed
            .iter()
            .all(|bit| bit.load(Ordering::Acquire))
    }

    fn reset(&self) {
        for bit in &self.claimed {
            bit.store(false, Ordering::Release);
        }
    }
}

/// Dispatcher for the quiesced-window cleanup tasks.
///
/// External collaborators feed pressure through the `note_*` / `request_*`
/// methods between safepoints; the coordinator calls
/// [`run`](CleanupDispatcher::run) while all workers are halted.
#[derive(Debug, Default)]
pub struct CleanupDispatcher {
    subtasks: SubTasksDone,

    // Pressure fed by external collaborators.
    idle_locks: AtomicUsize,
    pending_ic_updates: AtomicUsize,
    needs_symbol_rehash: AtomicBool,
    needs_string_rehash: AtomicBool,
    needs_loader_purge: AtomicBool,
    needs_dictionary_resize: AtomicBool,

    // Work performed, for diagnostics and tests.
    deflated_total: AtomicUsize,
    ic_updates_total: AtomicUsize,
    policy_ticks: AtomicUsize,
    symbol_rehashes: AtomicUsize,
    string_rehashes: AtomicUsize,
    loader_purges: AtomicUsize,
    dictionary_resizes: AtomicUsize,
    safepoints_served: AtomicUsize,
}

impl CleanupDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    // --- pressure intake ---

    pub fn note_idle_locks(&self, n: usize) {
        self.idle_locks.fetch_add(n, Ordering::AcqRel);
    }

    pub fn note_inline_cache_updates(&self, n: usize) {
        self.pending_ic_updates.fetch_add(n, Ordering::AcqRel);
    }

    pub fn request_symbol_rehash(&self) {
        self.needs_symbol_rehash.store(true, Ordering::Release);
    }

    pub fn request_string_rehash(&self) {
        self.needs_string_rehash.store(true, Ordering::Release);
    }

    pub fn request_loader_purge(&self) {
        self.needs_loader_purge.store(true, Ordering::Release);
    }

    pub fn request_dictionary_resize(&self) {
        self.needs_dictionary_resize.store(true, Ordering::Release);
    }

    /// Whether enough pressure has built up to justify a periodic cleanup
    /// safepoint on its own.
    pub fn is_cleanup_needed(&self) -> bool {
        self.idle_locks.load(Ordering::Acquire) > DEFLATION_PRESSURE_THRESHOLD
            || self.pending_ic_updates.load(Ordering::Acquire) > 0
    }

    // --- execution ---

    /// Run every task exactly once. Called by the coordinator inside the
    /// quiesced window; `pool_workers > 1` fans the claim loop out over the
    /// rayon pool, otherwise everything runs serially on the caller.
    ///
    /// Returns only after every task has been claimed and the claiming
    /// worker has finished it (the rayon scope is the completion barrier).
    pub(crate) fn run(&self, generation: u64, tracing: &SafepointTracing, pool_workers: usize) {
        self.subtasks.reset();

        if pool_workers > 1 {
            rayon::scope(|scope| {
                for _ in 0..pool_workers {
                    scope.spawn(|_| self.claim_loop(generation, tracing));
                }
            });
        } else {
            self.claim_loop(generation, tracing);
        }

        assert!(
            self.subtasks.all_claimed(),
            "cleanup dispatcher finished with unclaimed tasks"
        );
        self.safepoints_served.fetch_add(1, Ordering::Relaxed);
    }

    fn claim_loop(&self, generation: u64, tracing: &SafepointTracing) {
        for (task, run) in DISPATCH_TABLE.iter() {
            if self.subtasks.try_claim(*task) {
                let started = Instant::now();
                run(self);
                tracing.cleanup_task(generation, task.name(), started.elapsed());
            }
        }
    }

    // --- diagnostics ---

    pub fn deflated_total(&self) -> usize {
        self.deflated_total.load(Ordering::Relaxed)
    }

    pub fn ic_updates_total(&self) -> usize {
        self.ic_updates_total.load(Ordering::Relaxed)
    }

    pub fn policy_ticks(&self) -> usize {
        self.policy_ticks.load(Ordering::Relaxed)
    }

    pub fn symbol_rehashes(&self) -> usize {
        self.symbol_rehashes.load(Ordering::Relaxed)
    }

    pub fn string_rehashes(&self) -> usize {
        self.string_rehashes.load(Ordering::Relaxed)
    }

    pub fn loader_purges(&self) -> usize {
        self.loader_purges.load(Ordering::Relaxed)
    }

    pub fn dictionary_resizes(&self) -> usize {
        self.dictionary_resizes.load(Ordering::Relaxed)
    }

    pub fn safepoints_served(&self) -> usize {
        self.safepoints_served.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::trace::SafepointTracing;
    use std::sync::Arc;

    #[test]
    fn serial_run_claims_every_task_once() {
        let dispatcher = CleanupDispatcher::new();
        let tracing = SafepointTracing::new();

        dispatcher.note_idle_locks(5);
        dispatcher.request_symbol_rehash();
        dispatcher.run(1, &tracing, 1);

        assert_eq!(dispatcher.deflated_total(), 5);
        assert_eq!(dispatcher.policy_ticks(), 1);
        assert_eq!(dispatcher.symbol_rehashes(), 1);
        // No pressure, so the conditional tasks no-oped but still claimed.
        assert_eq!(dispatcher.string_rehashes(), 0);
        assert_eq!(dispatcher.safepoints_served(), 1);
    }

    #[test]
    fn parallel_run_is_still_exactly_once() {
        let dispatcher = CleanupDispatcher::new();
        let tracing = SafepointTracing::new();

        for round in 1..=10u64 {
            dispatcher.note_idle_locks(1);
            dispatcher.run(2 * round - 1, &tracing, 4);
        }

        // One policy tick per safepoint regardless of pool width.
        assert_eq!(dispatcher.policy_ticks(), 10);
        assert_eq!(dispatcher.deflated_total(), 10);
    }

    #[test]
    fn claims_race_to_a_single_winner() {
        let subtasks = Arc::new(SubTasksDone::new());
        let winners = Arc::new(AtomicUsize::new(0));

        crossbeam::scope(|scope| {
            for _ in 0..8 {
                let subtasks = Arc::clone(&subtasks);
                let winners = Arc::clone(&winners);
                scope.spawn(move |_| {
                    if subtasks.try_claim(CleanupTask::DeflateIdleLocks) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(winners.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cleanup_pressure_thresholds() {
        let dispatcher = CleanupDispatcher::new();
        assert!(!dispatcher.is_cleanup_needed());

        dispatcher.note_inline_cache_updates(1);
        assert!(dispatcher.is_cleanup_needed());

        let tracing = SafepointTracing::new();
        dispatcher.run(1, &tracing, 1);
        assert!(!dispatcher.is_cleanup_needed());
    }
}
