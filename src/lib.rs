//! Global safepoint coordination for a managed runtime.
//!
//! A privileged coordinator thread brings every worker (mutator) thread to
//! a quiesced, memory-consistent state, runs an operation while all workers
//! are halted, then releases them. The crate provides:
//!
//! - the coordinator state machine and its generation-counted rendezvous
//!   ([`safepoint`]),
//! - the worker-side poll and block protocol ([`thread`],
//!   [`safepoint::block`]),
//! - the generation-tagged wait barrier workers park on ([`barrier`]),
//! - the cleanup-task dispatcher that runs inside the quiesced window
//!   ([`cleanup`]),
//! - a raw monitor: a recursive lock with wait/notify that diagnostic
//!   agents can use without deadlocking against the safepoint
//!   ([`monitor`]).
//!
//! # Examples
//!
//! ```
//! use quiesce::{SafepointConfig, SafepointCoordinator, WorkerThread};
//!
//! let coordinator = SafepointCoordinator::new(SafepointConfig::default());
//!
//! let worker = WorkerThread::new(1);
//! coordinator.register_worker(&worker);
//!
//! let mutator = {
//!     let worker = worker.clone();
//!     std::thread::spawn(move || {
//!         while !worker.is_terminated() {
//!             // ... user code ...
//!             worker.pollcheck();
//!         }
//!     })
//! };
//!
//! coordinator.begin("flush-caches");
//! // All workers are halted here.
//! coordinator.end();
//!
//! worker.terminate();
//! mutator.join().unwrap();
//! coordinator.unregister_worker(&worker);
//! ```

pub mod barrier;
pub mod cleanup;
pub mod error;
pub mod monitor;
pub mod ordering;
pub mod park;
pub mod poll_macros;
pub mod safepoint;
pub mod thread;

pub use barrier::WaitBarrier;
pub use cleanup::{CleanupDispatcher, CleanupTask};
pub use error::{MonitorResult, RawMonitorError};
pub use monitor::{RawMonitorHandle, WaitOutcome};
pub use park::{ParkEvent, ParkOutcome};
pub use safepoint::{
    SafepointConfig, SafepointCoordinator, SafepointEvent, SafepointPhase, SafepointScope,
    SafepointStats,
};
pub use thread::{ExecutionMode, WorkerKind, WorkerRegistry, WorkerThread};
