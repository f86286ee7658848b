//! Global safepoint coordination.
//!
//! The protocol in one paragraph: the coordinator arms a generation-tagged
//! wait barrier, publishes an odd generation, arms every worker's poll
//! word, and spins until each worker is either observed in a safe execution
//! mode or has parked itself on the barrier. Inside the quiesced window it
//! runs the cleanup dispatcher and the privileged operation; on the way out
//! it publishes the next even generation, clears the polls, and disarms the
//! barrier, releasing every parked worker.
//!
//! Workers participate through [`WorkerThread::pollcheck`], an inline load
//! of their poll word that branches to [`block`] when armed.
//!
//! [`WorkerThread::pollcheck`]: crate::thread::WorkerThread::pollcheck

pub mod block;
pub mod coordinator;
pub(crate) mod state;
pub mod trace;


pub use block::{block, blocks_total};
pub use coordinator::{SafepointConfig, SafepointCoordinator, SafepointPhase, SafepointScope};
pub use trace::{SafepointEvent, SafepointStats};
