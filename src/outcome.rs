//! Outcome classification
//!
//! Maps what the waiter and the resource monitor observed onto exactly one
//! terminal outcome, a process exit code and a one-line diagnostic.
//! Nothing in here touches the OS: `classify` is a pure function.

use std::fmt;
use std::path::Path;

use crate::config::LimitConfig;
use crate::error::SystemError;

/// How a reaped child terminated, as decided by the platform backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// Normal exit with the given exit code
    Exited(u32),
    /// Signal or unhandled-exception style termination
    Abnormal,
}

/// Result of waiting for the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// Child terminated on its own; `raw_status` is the platform's raw value
    Completed {
        raw_status: u32,
        kind: TerminationKind,
    },
    /// Timeout elapsed; the child has been killed
    TimedOut,
    /// The wait primitive failed
    SystemError(SystemError),
}

/// Peak memory observed for the child
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub peak_memory_bytes: u64,
}

/// Final outcome of one supervised run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    NonZeroExit(u32),
    Crashed(u32),
    TimedOut,
    OutOfMemory(u64),
    SystemError(String),
}

impl ExecutionOutcome {
    /// Exit code handed back to the orchestrator
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionOutcome::Success => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::NonZeroExit(_) => "nonzero_exit",
            ExecutionOutcome::Crashed(_) => "crashed",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::OutOfMemory(_) => "out_of_memory",
            ExecutionOutcome::SystemError(_) => "system_error",
        };
        write!(f, "{}", s)
    }
}

/// Classified result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: ExecutionOutcome,
    pub exit_code: i32,
    /// Human-readable line, empty on success
    pub diagnostic: String,
}

impl Verdict {
    fn new(outcome: ExecutionOutcome, diagnostic: String) -> Self {
        Self {
            exit_code: outcome.exit_code(),
            outcome,
            diagnostic,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Success)
    }
}

/// Round up to the nearest multiple of 1000
pub fn round_up_to_thousand(n: u64) -> u64 {
    n.div_ceil(1000).saturating_mul(1000)
}

/// Classify a finished run
pub fn classify(
    executable: &Path,
    wait: &WaitResult,
    limits: &LimitConfig,
    sample: &ResourceSample,
) -> Verdict {
    let exe = executable.display();
    match wait {
        WaitResult::SystemError(err) => {
            Verdict::new(ExecutionOutcome::SystemError(err.to_string()), err.to_string())
        }
        WaitResult::TimedOut => {
            let timeout_ms = limits.timeout_secs.saturating_mul(1000);
            Verdict::new(
                ExecutionOutcome::TimedOut,
                format!(
                    "Executable file \"{}\" didn't terminate in {} seconds",
                    exe,
                    round_up_to_thousand(timeout_ms) / 1000
                ),
            )
        }
        WaitResult::Completed {
            raw_status,
            kind: TerminationKind::Abnormal,
        } => Verdict::new(
            ExecutionOutcome::Crashed(*raw_status),
            format!(
                "Executable file \"{}\" terminated abnormally with status 0x{:08x}",
                exe, raw_status
            ),
        ),
        WaitResult::Completed {
            kind: TerminationKind::Exited(code),
            ..
        } if *code != 0 => Verdict::new(
            ExecutionOutcome::NonZeroExit(*code),
            format!(
                "Executable file \"{}\" terminated with exit code 0x{:08x} != 0",
                exe, code
            ),
        ),
        WaitResult::Completed { .. } => {
            let used = sample.peak_memory_bytes;
            if used > limits.memory_limit_bytes {
                Verdict::new(
                    ExecutionOutcome::OutOfMemory(used),
                    format!(
                        "Executable file \"{}\" used {}Ki > {}Ki",
                        exe,
                        round_up_to_thousand(used) / 1000,
                        round_up_to_thousand(limits.memory_limit_bytes) / 1000
                    ),
                )
            } else {
                Verdict::new(ExecutionOutcome::Success, String::new())
            }
        }
    }
}
