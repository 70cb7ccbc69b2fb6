//! POSIX backend
//!
//! The child is created with fork and replaces its image with `execv`.
//! Redirection happens in the child right before the image replacement.
//! There is no proactive memory ceiling here: the peak resident set size is
//! read from `wait4` once the child has been reaped.
//!
//! A no-op SIGCHLD handler is installed before fork and kept until the child
//! is reaped. This keeps an inherited "ignore SIGCHLD" disposition from
//! reaping the child automatically, and it wakes the polling waiter.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{access, chdir, close, dup2, fork, AccessFlags, ForkResult, Pid};
use tracing::{debug, info, warn};

use super::wait::{self, SigchldTrap, Waited};
use crate::config::LimitConfig;
use crate::error::SystemError;
use crate::outcome::{ResourceSample, TerminationKind, WaitResult};
use crate::runner::{LaunchSpec, Supervisor};

/// Scale of `ru_maxrss`: bytes on Apple targets, KiB elsewhere
#[cfg(target_vendor = "apple")]
pub const RU_MAXRSS_UNIT: u64 = 1;
#[cfg(not(target_vendor = "apple"))]
pub const RU_MAXRSS_UNIT: u64 = 1024;

/// Exit status of a child that failed before `execv` succeeded
const EXEC_FAILURE_STATUS: libc::c_int = 127;

/// How `wait` blocks for the child
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Kernel timed wait (pidfd + poll) where available, polling otherwise
    #[default]
    Native,
    /// `wait4(WNOHANG)` + interruptible sleep, woken by SIGCHLD
    Polling,
}

/// fork/execv supervisor with retroactive memory accounting
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixSupervisor {
    strategy: WaitStrategy,
}

impl PosixSupervisor {
    pub fn new(strategy: WaitStrategy) -> Self {
        Self { strategy }
    }

    pub fn polling() -> Self {
        Self::new(WaitStrategy::Polling)
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }
}

/// Status and usage collected when the child is reaped
#[derive(Debug, Clone, Copy)]
struct Reaped {
    raw_status: libc::c_int,
    max_rss: i64,
}

/// Forked child owned by one run
///
/// Dropping an unreaped child kills it with SIGKILL and reaps it, then
/// restores the SIGCHLD disposition.
#[derive(Debug)]
pub struct PosixChild {
    pid: Pid,
    reaped: Option<Reaped>,
    sigchld: Option<SigchldTrap>,
}

impl PosixChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.is_some()
    }

    /// Non-blocking reap. Returns true once the child has been reaped.
    pub(crate) fn try_reap(&mut self) -> Result<bool, Errno> {
        if self.reaped.is_some() {
            return Ok(true);
        }
        match self.wait4(libc::WNOHANG) {
            Err(Errno::EINTR) => Ok(false),
            other => other,
        }
    }

    fn reap_blocking(&mut self) -> Result<(), Errno> {
        while self.reaped.is_none() {
            match self.wait4(0) {
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn wait4(&mut self, options: libc::c_int) -> Result<bool, Errno> {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain old data, wait4 fills it in
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, options, &mut rusage) };
        match rc {
            -1 => Err(Errno::last()),
            0 => Ok(false),
            _ => {
                self.reaped = Some(Reaped {
                    raw_status: status,
                    max_rss: rusage.ru_maxrss as i64,
                });
                Ok(true)
            }
        }
    }

    /// SIGKILL the child (no grace period) and reap it
    pub(crate) fn kill_and_reap(&mut self) -> Result<(), SystemError> {
        if self.reaped.is_some() {
            return Ok(());
        }
        kill(self.pid, Signal::SIGKILL).map_err(|e| SystemError::from_errno("kill", e))?;
        self.reap_blocking()
            .map_err(|e| SystemError::from_errno("wait4", e))
    }

    /// Restore SIGCHLD once the child is gone
    fn release_sigchld(&mut self) -> Result<(), SystemError> {
        match self.sigchld.take() {
            Some(trap) => trap.restore(),
            None => Ok(()),
        }
    }

    fn completed(&self) -> Option<WaitResult> {
        self.reaped.map(|reaped| {
            let status = reaped.raw_status;
            let kind = if libc::WIFEXITED(status) {
                TerminationKind::Exited(libc::WEXITSTATUS(status) as u32)
            } else {
                TerminationKind::Abnormal
            };
            WaitResult::Completed {
                raw_status: status as u32,
                kind,
            }
        })
    }

    fn peak_memory_bytes(&self) -> u64 {
        self.reaped
            .map(|reaped| (reaped.max_rss.max(0) as u64).saturating_mul(RU_MAXRSS_UNIT))
            .unwrap_or(0)
    }
}

impl Drop for PosixChild {
    fn drop(&mut self) {
        if self.reaped.is_none() {
            debug!("Releasing unreaped child {}", self.pid);
            if let Err(err) = self.kill_and_reap() {
                warn!("Failed to release child {}: {}", self.pid, err);
            }
        }
    }
}

impl Supervisor for PosixSupervisor {
    type Child = PosixChild;

    fn launch(&self, spec: &LaunchSpec) -> Result<PosixChild, SystemError> {
        let dir_flags = AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK | AccessFlags::F_OK;
        access(spec.work_dir.as_path(), dir_flags)
            .map_err(|e| SystemError::from_errno("access", e))?;

        // The child changes directory before execv
        let executable = std::fs::canonicalize(&spec.executable)
            .map_err(|e| SystemError::from_io("realpath", &e))?;

        // Everything the child needs is allocated before fork
        let image = ChildImage {
            executable: to_cstring(&executable)?,
            input: to_cstring(&spec.input_path())?,
            output: to_cstring(&spec.output_path())?,
            work_dir: to_cstring(&spec.work_dir)?,
        };
        let argv: [*const libc::c_char; 2] = [image.executable.as_ptr(), ptr::null()];
        let (report_read, report_write) = cloexec_pipe()?;
        let sigchld = SigchldTrap::install()?;

        // SAFETY: the child only makes async-signal-safe calls until execv or _exit
        match unsafe { fork() }.map_err(|e| SystemError::from_errno("fork", e))? {
            ForkResult::Child => image.exec(&argv, report_write.as_raw_fd()),
            ForkResult::Parent { child } => {
                drop(report_write);
                let child = PosixChild {
                    pid: child,
                    reaped: None,
                    sigchld: Some(sigchld),
                };

                // EOF without data means execv succeeded and closed the pipe
                let mut report = Vec::with_capacity(CHILD_REPORT_LEN);
                File::from(report_read)
                    .read_to_end(&mut report)
                    .map_err(|e| SystemError::from_io("read", &e))?;
                if !report.is_empty() {
                    return Err(decode_child_report(&report));
                }

                info!("Spawned {:?} as pid {}", executable, child.pid);
                Ok(child)
            }
        }
    }

    fn attach(&self, child: &mut PosixChild, limits: &LimitConfig) -> Result<(), SystemError> {
        debug!(
            "No proactive memory ceiling for pid {}; {} bytes checked after exit",
            child.pid, limits.memory_limit_bytes
        );
        Ok(())
    }

    fn wait(&self, child: &mut PosixChild, timeout: Duration) -> WaitResult {
        let waited = match self.strategy {
            WaitStrategy::Native => wait::wait_native(child, timeout),
            WaitStrategy::Polling => wait::wait_polling(child, timeout),
        };

        let result = match waited {
            Ok(Waited::Exited) => child
                .completed()
                .unwrap_or_else(|| WaitResult::SystemError(SystemError::new("wait4", "child not reaped"))),
            Ok(Waited::Expired) => {
                info!("Pid {} exceeded {:?}, killing", child.pid, timeout);
                match child.kill_and_reap() {
                    Ok(()) => WaitResult::TimedOut,
                    Err(err) => WaitResult::SystemError(err),
                }
            }
            Err(err) => {
                if let Err(kill_err) = child.kill_and_reap() {
                    warn!("Failed to kill pid {} after wait error: {}", child.pid, kill_err);
                }
                return WaitResult::SystemError(err);
            }
        };

        if !child.is_reaped() {
            return result;
        }
        match child.release_sigchld() {
            Ok(()) => result,
            Err(err) => WaitResult::SystemError(err),
        }
    }

    fn sample(&self, child: &PosixChild) -> ResourceSample {
        ResourceSample {
            peak_memory_bytes: child.peak_memory_bytes(),
        }
    }
}

/// Pre-fork copies of everything the child touches
struct ChildImage {
    executable: CString,
    input: CString,
    output: CString,
    work_dir: CString,
}

/// Child-side setup step, reported back through the pipe on failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ChildStage {
    OpenInput = 0,
    OpenOutput = 1,
    Redirect = 2,
    Chdir = 3,
    Exec = 4,
}

impl ChildStage {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChildStage::OpenInput),
            1 => Some(ChildStage::OpenOutput),
            2 => Some(ChildStage::Redirect),
            3 => Some(ChildStage::Chdir),
            4 => Some(ChildStage::Exec),
            _ => None,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            ChildStage::OpenInput => "open input",
            ChildStage::OpenOutput => "open output",
            ChildStage::Redirect => "dup2",
            ChildStage::Chdir => "chdir",
            ChildStage::Exec => "execv",
        }
    }
}

/// errno (native endian i32) followed by the stage byte
const CHILD_REPORT_LEN: usize = 5;

impl ChildImage {
    fn exec(&self, argv: &[*const libc::c_char; 2], report_fd: RawFd) -> ! {
        let (stage, errno) = match self.redirect_and_exec(argv) {
            Ok(never) => match never {},
            Err(failure) => failure,
        };

        let mut report = [0u8; CHILD_REPORT_LEN];
        report[..4].copy_from_slice(&(errno as i32).to_ne_bytes());
        report[4] = stage as u8;
        // SAFETY: write and _exit are async-signal-safe
        unsafe {
            libc::write(report_fd, report.as_ptr().cast(), report.len());
            libc::_exit(EXEC_FAILURE_STATUS)
        }
    }

    fn redirect_and_exec(
        &self,
        argv: &[*const libc::c_char; 2],
    ) -> Result<Infallible, (ChildStage, Errno)> {
        let input = open(self.input.as_c_str(), OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| (ChildStage::OpenInput, e))?;
        move_fd(input, libc::STDIN_FILENO)?;

        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH;
        let output = open(
            self.output.as_c_str(),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            mode,
        )
        .map_err(|e| (ChildStage::OpenOutput, e))?;
        move_fd(output, libc::STDOUT_FILENO)?;

        chdir(self.work_dir.as_c_str()).map_err(|e| (ChildStage::Chdir, e))?;
        // SAFETY: both strings and the NULL-terminated argv were built before fork
        unsafe { libc::execv(self.executable.as_ptr(), argv.as_ptr()) };
        Err((ChildStage::Exec, Errno::last()))
    }
}

fn move_fd(fd: RawFd, target: RawFd) -> Result<(), (ChildStage, Errno)> {
    if fd != target {
        dup2(fd, target).map_err(|e| (ChildStage::Redirect, e))?;
        let _ = close(fd);
    }
    Ok(())
}

fn decode_child_report(report: &[u8]) -> SystemError {
    if report.len() != CHILD_REPORT_LEN {
        return SystemError::new("fork", "malformed child setup report");
    }
    let mut errno = [0u8; 4];
    errno.copy_from_slice(&report[..4]);
    let errno = Errno::from_raw(i32::from_ne_bytes(errno));
    match ChildStage::from_u8(report[4]) {
        Some(stage) => SystemError::from_errno(stage.operation(), errno),
        None => SystemError::new("fork", "malformed child setup report"),
    }
}

fn to_cstring(path: &Path) -> Result<CString, SystemError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SystemError::new("execv", format!("path {:?} contains a NUL byte", path)))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), SystemError> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| SystemError::from_errno("pipe2", e))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), SystemError> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = nix::unistd::pipe().map_err(|e| SystemError::from_errno("pipe", e))?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| SystemError::from_errno("fcntl", e))?;
    }
    Ok((read, write))
}
