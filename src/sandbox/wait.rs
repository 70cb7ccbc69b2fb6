//! Timed waits for a forked child
//!
//! Two ways to block until the child exits or the budget runs out:
//! - native: a pidfd polled with a timeout (Linux 5.3+)
//! - polling: `wait4(WNOHANG)` followed by an interruptible sleep, woken by
//!   SIGCHLD
//!
//! Both rely on the `SigchldTrap` installed by `launch` before fork. An
//! ignored SIGCHLD would make the kernel reap the child on its own, and the
//! default disposition discards the signal without waking sleepers.
//!
//! Neither path kills the child; that is up to the caller.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::warn;

use super::posix::PosixChild;
use crate::error::SystemError;

/// Longest single sleep of the polling loop
pub const POLL_SLICE: Duration = Duration::from_millis(100);

/// How a timed wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Waited {
    /// Child reaped
    Exited,
    /// Budget exhausted, child still running
    Expired,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn wait_native(child: &mut PosixChild, timeout: Duration) -> Result<Waited, SystemError> {
    use std::os::fd::AsFd;

    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let pidfd = match pidfd::open(child.pid()) {
        Ok(fd) => fd,
        Err(Errno::ENOSYS) | Err(Errno::EPERM) => {
            tracing::debug!("pidfd_open unavailable, falling back to polling wait");
            return wait_polling(child, timeout);
        }
        Err(e) => return Err(SystemError::from_errno("pidfd_open", e)),
    };

    let deadline = deadline_after(timeout);
    loop {
        if child.try_reap().map_err(|e| SystemError::from_errno("wait4", e))? {
            return Ok(Waited::Exited);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Waited::Expired);
        }

        let mut fds = [PollFd::new(pidfd.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(poll_timeout_ms(remaining)).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(SystemError::from_errno("poll", e)),
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn wait_native(child: &mut PosixChild, timeout: Duration) -> Result<Waited, SystemError> {
    wait_polling(child, timeout)
}

/// Poll for the child, sleeping at most `POLL_SLICE` between attempts
pub(crate) fn wait_polling(child: &mut PosixChild, timeout: Duration) -> Result<Waited, SystemError> {
    poll_until_deadline(child, timeout, POLL_SLICE)
}

fn poll_until_deadline(
    child: &mut PosixChild,
    timeout: Duration,
    slice: Duration,
) -> Result<Waited, SystemError> {
    let deadline = deadline_after(timeout);
    loop {
        if child.try_reap().map_err(|e| SystemError::from_errno("wait4", e))? {
            return Ok(Waited::Exited);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Waited::Expired);
        }

        let request = to_timespec(remaining.min(slice));
        // SAFETY: request is a valid timespec, the remainder is not needed
        let rc = unsafe { libc::nanosleep(&request, std::ptr::null_mut()) };
        if rc == -1 {
            match Errno::last() {
                // SIGCHLD or any other signal: check the child again
                Errno::EINTR => continue,
                e => return Err(SystemError::from_errno("nanosleep", e)),
            }
        }
    }
}

extern "C" fn sigchld_trap(_signo: libc::c_int) {}

/// Scoped no-op SIGCHLD handler
///
/// Installed before fork and held until the child is reaped, so the child
/// is never reaped by the kernel behind our back. Dropping the guard
/// restores the previous disposition.
#[derive(Debug)]
pub(crate) struct SigchldTrap {
    previous: Option<SigAction>,
}

impl SigchldTrap {
    pub(crate) fn install() -> Result<Self, SystemError> {
        // SA_RESTART is left out so that sleeping calls return EINTR
        let action = SigAction::new(
            SigHandler::Handler(sigchld_trap),
            SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        // SAFETY: the handler does nothing
        let previous = unsafe { sigaction(Signal::SIGCHLD, &action) }
            .map_err(|e| SystemError::from_errno("sigaction set", e))?;
        Ok(Self {
            previous: Some(previous),
        })
    }

    pub(crate) fn restore(mut self) -> Result<(), SystemError> {
        self.restore_previous()
    }

    fn restore_previous(&mut self) -> Result<(), SystemError> {
        if let Some(previous) = self.previous.take() {
            // SAFETY: reinstalls the disposition that was in place before
            unsafe { sigaction(Signal::SIGCHLD, &previous) }
                .map_err(|e| SystemError::from_errno("sigaction restore", e))?;
        }
        Ok(())
    }
}

impl Drop for SigchldTrap {
    fn drop(&mut self) {
        if let Err(err) = self.restore_previous() {
            warn!("{}", err);
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64))
}

fn to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

/// Milliseconds for `poll`, rounded up so the call never returns early
#[cfg(any(target_os = "linux", target_os = "android", test))]
fn poll_timeout_ms(remaining: Duration) -> i32 {
    let millis = remaining.as_nanos().div_ceil(1_000_000);
    millis.min(i32::MAX as u128) as i32
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod pidfd {
    use std::os::fd::OwnedFd;

    use nix::errno::Errno;
    use nix::unistd::Pid;
    use rustix::process::{pidfd_open, PidfdFlags};

    /// `pidfd_open(2)`; the descriptor is close-on-exec
    pub(super) fn open(pid: Pid) -> Result<OwnedFd, Errno> {
        let pid = rustix::process::Pid::from_raw(pid.as_raw()).ok_or(Errno::ESRCH)?;
        pidfd_open(pid, PidfdFlags::empty()).map_err(|e| Errno::from_raw(e.raw_os_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{LaunchSpec, Supervisor};
    use crate::sandbox::PosixSupervisor;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout_ms(Duration::from_micros(1)), 1);
        assert_eq!(poll_timeout_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(poll_timeout_ms(Duration::from_secs(u64::MAX)), i32::MAX);
    }

    #[test]
    fn test_to_timespec() {
        let ts = to_timespec(Duration::new(2, 500));
        assert_eq!(ts.tv_sec, 2);
        assert_eq!(ts.tv_nsec, 500);
    }

    #[test]
    #[serial]
    fn test_sigchld_cuts_sleep_short() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("lab.sh");
        std::fs::write(&exe, "#!/bin/sh\nsleep 0.3\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("in.txt"), "").unwrap();

        let spec = LaunchSpec::new(&exe).with_work_dir(dir.path());
        let mut child = PosixSupervisor::polling().launch(&spec).unwrap();

        // One slice spans the whole budget: only SIGCHLD can end the sleep early
        let start = Instant::now();
        let waited =
            poll_until_deadline(&mut child, Duration::from_secs(10), Duration::from_secs(10)).unwrap();
        assert_eq!(waited, Waited::Exited);
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
    }
}
