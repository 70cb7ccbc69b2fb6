//! Lab Tester - bounded execution supervisor
//!
//! Runs one untrusted lab executable with stdin/stdout redirected to files,
//! under a wall-clock timeout and a peak-memory ceiling, and classifies how
//! it terminated.
//!
//! There is no filesystem or network isolation: only time and memory are
//! bounded.

pub mod config;
pub mod error;
pub mod helper;
pub mod outcome;
pub mod runner;
pub mod sandbox;

pub use config::LimitConfig;
pub use error::SystemError;
pub use helper::HelperInvocation;
pub use outcome::{
    classify, ExecutionOutcome, ResourceSample, TerminationKind, Verdict, WaitResult,
};
pub use runner::{supervise, LaunchSpec, Supervisor};
pub use sandbox::PlatformSupervisor;

/// Run `spec` with the backend for this platform
pub fn run(spec: &LaunchSpec, limits: &LimitConfig) -> Verdict {
    supervise(&PlatformSupervisor::default(), spec, limits)
}
