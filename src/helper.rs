//! Helper re-invocation
//!
//! An orchestrator runs each test by re-invoking the supervisor binary as
//! `labtest -m <KiB> -t <secs> -e <exe>` and looks only at its exit code.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::LimitConfig;

/// One helper process invocation
#[derive(Debug, Clone)]
pub struct HelperInvocation {
    /// Path of the supervisor binary
    program: PathBuf,
    limits: LimitConfig,
    executable: PathBuf,
}

impl HelperInvocation {
    pub fn new(program: impl AsRef<Path>, limits: LimitConfig, executable: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            limits,
            executable: executable.as_ref().to_path_buf(),
        }
    }

    /// Invocation of the running binary itself
    pub fn current_exe(limits: LimitConfig, executable: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, limits, executable))
    }

    /// Arguments after the program name
    pub fn args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-m"),
            OsString::from(self.limits.memory_limit_kib().to_string()),
            OsString::from("-t"),
            OsString::from(self.limits.timeout_secs.to_string()),
            OsString::from("-e"),
            self.executable.clone().into_os_string(),
        ]
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args());
        command
    }

    /// Run the helper and report whether the run was classified as success
    pub fn run(&self) -> io::Result<bool> {
        debug!("Invoking helper {:?} with {:?}", self.program, self.args());
        let status = self.command().status()?;
        Ok(status.success())
    }
}
