//! Sandbox module - Platform backends
//!
//! One `Supervisor` implementation per platform:
//! - `PosixSupervisor`: fork/execv, retroactive `wait4` accounting, timed wait
//! - `JobObjectSupervisor`: suspended CreateProcess attached to a job object
//!
//! The sandbox module does NOT:
//! - Classify outcomes or format diagnostics
//! - Isolate the filesystem or the network

#[cfg(unix)]
pub mod posix;
#[cfg(unix)]
mod wait;

#[cfg(windows)]
pub mod job_object;

#[cfg(unix)]
pub use posix::{PosixChild, PosixSupervisor, WaitStrategy, RU_MAXRSS_UNIT};
#[cfg(unix)]
pub use wait::POLL_SLICE;

#[cfg(windows)]
pub use job_object::{JobObjectChild, JobObjectSupervisor, CRASH_SENTINEL};

/// Backend for the compilation target
#[cfg(unix)]
pub type PlatformSupervisor = PosixSupervisor;
#[cfg(windows)]
pub type PlatformSupervisor = JobObjectSupervisor;

#[cfg(not(any(unix, windows)))]
compile_error!("labtest supports unix and windows targets only");
