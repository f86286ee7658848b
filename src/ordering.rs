//! Named memory-ordering primitives.
//!
//! The safepoint protocol is specified in terms of a small vocabulary of
//! ordered operations: acquire loads, release stores, full (StoreLoad)
//! fences and a compiler-only barrier. Spelling them out as named functions
//! keeps the protocol code readable against that vocabulary instead of a
//! scatter of `Ordering::` arguments, and gives the fences a single place
//! to document their contracts.
//!
//! Contract: `store_release(x, v); full_fence(); load(y)` orders the store
//! before the load as observed by any other thread. A successful `cas` has
//! both acquire and release semantics.

use std::sync::atomic::{
    compiler_fence, fence, AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

macro_rules! word_primitives {
    ($atomic:ty, $value:ty, $load:ident, $store:ident, $cas:ident) => {
        #[doc = concat!("Acquire load of a `", stringify!($value), "` word.")]
        #[inline(always)]
        pub fn $load(word: &$atomic) -> $value {
            word.load(Ordering::Acquire)
        }

        #[doc = concat!("Release store of a `", stringify!($value), "` word.")]
        #[inline(always)]
        pub fn $store(word: &$atomic, value: $value) {
            word.store(value, Ordering::Release)
        }

        #[doc = concat!(
            "Compare-and-swap on a `",
            stringify!($value),
            "` word. Acquire and release on success, acquire on failure."
        )]
        #[inline(always)]
        pub fn $cas(word: &$atomic, current: $value, new: $value) -> bool {
            word.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        }
    };
}

word_primitives!(AtomicU64, u64, load_acquire_u64, store_release_u64, cas_u64);
word_primitives!(AtomicU8, u8, load_acquire_u8, store_release_u8, cas_u8);
word_primitives!(
    AtomicUsize,
    usize,
    load_acquire_usize,
    store_release_usize,
    cas_usize
);
word_primitives!(
    AtomicBool,
    bool,
    load_acquire_bool,
    store_release_bool,
    cas_bool
);

/// Atomic add with full ordering, returning the previous value.
#[inline(always)]
pub fn fetch_add_usize(word: &AtomicUsize, n: usize) -> usize {
    word.fetch_add(n, Ordering::SeqCst)
}

/// Full two-way fence (StoreLoad included).
///
/// Nothing before the fence may be reordered with anything after it, on
/// either side of a concurrent observer.
#[inline(always)]
pub fn full_fence() {
    fence(Ordering::SeqCst)
}

/// Compiler-only barrier.
///
/// Prevents the compiler from reordering memory accesses across this point
/// without emitting a hardware fence.
#[inline(always)]
pub fn compiler_barrier() {
    compiler_fence(Ordering::SeqCst)
}
