//! Supervisor error type
//!
//! Every OS call that fails while launching, attaching to or waiting for the
//! child ends up here. These errors are fatal for the run and never retried.

use thiserror::Error;

/// An OS call failed during setup or waiting
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("System error: \"{reason}\" in {operation}")]
pub struct SystemError {
    /// Name of the failing call (e.g. "fork", "wait4", "CreateProcessW")
    pub operation: &'static str,
    /// OS-reported error text
    pub reason: String,
}

impl SystemError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }

    /// Build from an `io::Error`, keeping the OS text
    pub fn from_io(operation: &'static str, err: &std::io::Error) -> Self {
        Self::new(operation, err.to_string())
    }

    /// Build from the calling thread's last OS error
    pub fn last_os_error(operation: &'static str) -> Self {
        Self::from_io(operation, &std::io::Error::last_os_error())
    }

    #[cfg(unix)]
    pub fn from_errno(operation: &'static str, errno: nix::errno::Errno) -> Self {
        Self::new(operation, errno.desc())
    }
}
