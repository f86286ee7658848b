//! Error types for the quiesce runtime.

use thiserror::Error;

/// Errors returned by raw monitor operations.
///
/// These are the only errors that propagate to callers; everything else in
/// the safepoint protocol is either retried internally or fatal.
///
/// # Examples
///
/// ```
/// use quiesce::{RawMonitorError, RawMonitorHandle, WorkerThread};
///
/// let monitor = RawMonitorHandle::create("agent-lock");
/// let outsider = WorkerThread::service(901);
/// assert_eq!(monitor.exit(&outsider), Err(RawMonitorError::IllegalState));
/// ```
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMonitorError {
    /// The calling thread does not own the monitor.
    #[error("monitor operation by non-owner")]
    IllegalState,
    /// The wait was interrupted; the monitor has been reacquired.
    #[error("monitor wait interrupted")]
    Interrupted,
    /// The handle does not refer to a live monitor (destroyed or corrupt).
    #[error("invalid raw monitor handle")]
    InvalidHandle,
}

/// Result type for raw monitor operations.
pub type MonitorResult<T> = Result<T, RawMonitorError>;

/// Abort the process on an unrecoverable invariant violation.
///
/// The safepoint protocol has no way to unwind to a consistent state once
/// the coordinator has begun flipping global state, so a broken invariant
/// inside the quiesced window terminates the process.
#[cold]
pub(crate) fn fatal_error(msg: &str) -> ! {
    log::error!(target: "safepoint", "fatal: {msg}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_error_display() {
        assert_eq!(
            RawMonitorError::IllegalState.to_string(),
            "monitor operation by non-owner"
        );
        assert_eq!(
            RawMonitorError::Interrupted.to_string(),
            "monitor wait interrupted"
        );
        assert_eq!(
            RawMonitorError::InvalidHandle.to_string(),
            "invalid raw monitor handle"
        );
    }
}
