//! Macro-based pollcheck insertion.
//!
//! Without compiler support, bounded progress between polls comes from
//! discipline at the source level. These macros wrap ordinary loop
//! constructs and insert a pollcheck on the worker every `POLL_STRIDE`
//! iterations, keeping the fast path (a load and a branch) in the loop
//! body's shadow.

/// Iterations between polls inserted by [`poll_loop!`].
pub const POLL_STRIDE: usize = 1024;

/// Run a loop with periodic pollchecks on the given worker.
///
/// # Examples
///
/// ```
/// use quiesce::{poll_loop, WorkerThread};
///
/// let worker = WorkerThread::new(1);
/// let mut sum = 0u64;
/// poll_loop!(worker; for i in 0..100_000u64 => {
///     sum += i;
/// });
/// assert_eq!(sum, (0..100_000u64).sum());
/// ```
#[macro_export]
macro_rules! poll_loop {
    ($worker:expr; for $pat:pat in $iter:expr => { $($body:tt)* }) => {{
        let mut _poll_stride = 0usize;
        for $pat in $iter {
            if _poll_stride % $crate::poll_macros::POLL_STRIDE == 0 {
                $worker.pollcheck();
            }
            _poll_stride += 1;
            $($body)*
        }
    }};

    ($worker:expr; while $cond:expr => { $($body:tt)* }) => {{
        let mut _poll_stride = 0usize;
        while $cond {
            if _poll_stride % $crate::poll_macros::POLL_STRIDE == 0 {
                $worker.pollcheck();
            }
            _poll_stride += 1;
            $($body)*
        }
    }};
}

/// Bracket a long-running call with pollchecks on entry and exit.
///
/// # Examples
///
/// ```
/// use quiesce::{poll_call, WorkerThread};
///
/// let worker = WorkerThread::new(2);
/// let answer = poll_call!(worker; 6 * 7);
/// assert_eq!(answer, 42);
/// ```
#[macro_export]
macro_rules! poll_call {
    ($worker:expr; $call:expr) => {{
        $worker.pollcheck();
        let result = $call;
        $worker.pollcheck();
        result
    }};
}

#[cfg(test)]
mod tests {
    use crate::thread::WorkerThread;

    #[test]
    fn poll_loop_preserves_loop_semantics() {
        let worker = WorkerThread::new(21);
        let mut total = 0usize;
        poll_loop!(worker; for i in 0..10_000usize => {
            total += i;
        });
        assert_eq!(total, (0..10_000).sum());
    }

    #[test]
    fn poll_while_terminates() {
        let worker = WorkerThread::new(22);
        let mut n = 0usize;
        poll_loop!(worker; while n < 5000 => {
            n += 1;
        });
        assert_eq!(n, 5000);
    }

    #[test]
    fn poll_call_passes_value_through() {
        let worker = WorkerThread::new(23);
        let value = poll_call!(worker; "ok".len());
        assert_eq!(value, 2);
    }
}
