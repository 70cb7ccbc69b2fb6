//! Runner module - Supervision pipeline
//!
//! This module ties the platform backend to the classifier:
//! - `LaunchSpec`: what to run and where its stdin/stdout go
//! - `Supervisor`: the platform capability (launch, attach, resume, wait, sample)
//! - `supervise`: runs the pipeline once and classifies the result
//!
//! The runner module does NOT:
//! - Know how a platform limits or measures memory
//! - Format diagnostics (that's the classifier's job)
//! - Retry anything

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::LimitConfig;
use crate::error::SystemError;
use crate::outcome::{classify, ResourceSample, Verdict, WaitResult};

/// Well-known file the orchestrator stages before each run
pub const DEFAULT_INPUT_FILE: &str = "in.txt";
/// Well-known file the orchestrator checks after each run
pub const DEFAULT_OUTPUT_FILE: &str = "out.txt";

/// Launch specification for one run
///
/// `input` and `output` are resolved against `work_dir`, which is also the
/// child's working directory. Runs sharing a `work_dir` race on these files.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable to run, without arguments
    pub executable: PathBuf,
    /// Working directory of the child
    pub work_dir: PathBuf,
    /// Standard input, opened read-only
    pub input: PathBuf,
    /// Standard output, created or truncated
    pub output: PathBuf,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            work_dir: PathBuf::from("."),
            input: PathBuf::from(DEFAULT_INPUT_FILE),
            output: PathBuf::from(DEFAULT_OUTPUT_FILE),
        }
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_input(mut self, path: impl AsRef<Path>) -> Self {
        self.input = path.as_ref().to_path_buf();
        self
    }

    pub fn with_output(mut self, path: impl AsRef<Path>) -> Self {
        self.output = path.as_ref().to_path_buf();
        self
    }

    pub fn input_path(&self) -> PathBuf {
        self.work_dir.join(&self.input)
    }

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(&self.output)
    }
}

/// Platform capability for supervising one child
///
/// Dropping a `Child` must release every OS resource it holds; a child that
/// is still running at that point is killed and reaped.
pub trait Supervisor {
    type Child;

    /// Spawn the executable with redirected stdio
    fn launch(&self, spec: &LaunchSpec) -> Result<Self::Child, SystemError>;

    /// Attach memory accounting before the child runs user code
    fn attach(&self, child: &mut Self::Child, limits: &LimitConfig) -> Result<(), SystemError>;

    /// Let a suspended child run
    fn resume(&self, _child: &mut Self::Child) -> Result<(), SystemError> {
        Ok(())
    }

    /// Wait for termination; kills the child when `timeout` elapses
    fn wait(&self, child: &mut Self::Child, timeout: Duration) -> WaitResult;

    /// Peak memory of the terminated child
    fn sample(&self, child: &Self::Child) -> ResourceSample;
}

/// Run `spec` once under `limits` and classify the result
pub fn supervise<S: Supervisor>(supervisor: &S, spec: &LaunchSpec, limits: &LimitConfig) -> Verdict {
    let (wait, sample) = match run_child(supervisor, spec, limits) {
        Ok(observed) => observed,
        Err(err) => {
            warn!("Run of {:?} aborted: {}", spec.executable, err);
            (WaitResult::SystemError(err), ResourceSample::default())
        }
    };

    let verdict = classify(&spec.executable, &wait, limits, &sample);
    info!(
        "Run of {:?} finished: outcome={}, peak_memory={} bytes",
        spec.executable, verdict.outcome, sample.peak_memory_bytes
    );
    verdict
}

fn run_child<S: Supervisor>(
    supervisor: &S,
    spec: &LaunchSpec,
    limits: &LimitConfig,
) -> Result<(WaitResult, ResourceSample), SystemError> {
    // The child is dropped (and killed if still alive) on every early return
    let mut child = supervisor.launch(spec)?;
    supervisor.attach(&mut child, limits)?;
    supervisor.resume(&mut child)?;

    debug!(
        "Waiting for {:?} (timeout {}s)",
        spec.executable, limits.timeout_secs
    );
    let wait = supervisor.wait(&mut child, limits.timeout());
    let sample = supervisor.sample(&child);
    Ok((wait, sample))
}
