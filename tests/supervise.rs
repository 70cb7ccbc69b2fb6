//! End-to-end runs of the POSIX backend against small shell scripts
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serial_test::serial;
use tempfile::TempDir;

use labtest::sandbox::{PosixSupervisor, WaitStrategy};
use labtest::{supervise, ExecutionOutcome, LaunchSpec, LimitConfig, Supervisor, WaitResult};

const MIB: u64 = 1024 * 1024;

/// Working directory holding `lab.sh` and an `in.txt`
fn setup(script: &str, input: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("lab.sh");
    fs::write(&exe, format!("#!/bin/sh\n{}\n", script)).unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(dir.path().join("in.txt"), input).unwrap();
    (dir, exe)
}

fn spec_in(dir: &Path, exe: &Path) -> LaunchSpec {
    LaunchSpec::new(exe).with_work_dir(dir)
}

#[test]
#[serial]
fn test_clean_exit_is_success() {
    let (dir, exe) = setup("exit 0", "");
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    assert_eq!(verdict.outcome, ExecutionOutcome::Success);
    assert_eq!(verdict.exit_code, 0);
    assert!(verdict.diagnostic.is_empty());
}

#[test]
#[serial]
fn test_nonzero_exit() {
    let (dir, exe) = setup("exit 3", "");
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    assert_eq!(verdict.outcome, ExecutionOutcome::NonZeroExit(3));
    assert_eq!(verdict.exit_code, 1);
    assert!(verdict.diagnostic.ends_with("terminated with exit code 0x00000003 != 0"));
}

#[test]
#[serial]
fn test_memory_checked_after_exit() {
    // A single 128 MiB block buffer, filled from /dev/zero
    let (dir, exe) = setup("exec dd if=/dev/zero of=/dev/null bs=134217728 count=1", "");
    let limits = LimitConfig::new(64 * MIB, 5);
    let verdict = supervise(&PosixSupervisor::default(), &spec_in(dir.path(), &exe), &limits);

    match verdict.outcome {
        ExecutionOutcome::OutOfMemory(used) => assert!(used > 64 * MIB),
        other => panic!("expected out_of_memory, got {:?}", other),
    }
    assert_eq!(verdict.exit_code, 1);
    assert!(verdict.diagnostic.ends_with("Ki > 67109Ki"));
}

#[test]
#[serial]
fn test_timeout_kills_child() {
    let (dir, exe) = setup("while :; do :; done", "");
    let start = Instant::now();
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 1),
    );

    assert_eq!(verdict.outcome, ExecutionOutcome::TimedOut);
    assert!(verdict.diagnostic.ends_with("didn't terminate in 1 seconds"));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
}

#[test]
#[serial]
fn test_timed_out_child_is_reaped() {
    let (dir, exe) = setup("while :; do :; done", "");
    let supervisor = PosixSupervisor::default();
    let mut child = supervisor.launch(&spec_in(dir.path(), &exe)).unwrap();
    let pid = child.pid();

    assert_eq!(supervisor.wait(&mut child, Duration::from_millis(200)), WaitResult::TimedOut);
    assert!(child.is_reaped());
    drop(child);
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}

#[test]
#[serial]
fn test_dropped_child_is_killed() {
    let (dir, exe) = setup("while :; do :; done", "");
    let supervisor = PosixSupervisor::default();
    let child = supervisor.launch(&spec_in(dir.path(), &exe)).unwrap();
    let pid = child.pid();

    drop(child);
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}

#[test]
#[serial]
fn test_signal_is_crash() {
    let (dir, exe) = setup("kill -KILL $$", "");
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    match verdict.outcome {
        ExecutionOutcome::Crashed(raw) => {
            let raw = raw as libc::c_int;
            assert!(libc::WIFSIGNALED(raw));
            assert_eq!(libc::WTERMSIG(raw), libc::SIGKILL);
        }
        other => panic!("expected crashed, got {:?}", other),
    }
    assert!(verdict.diagnostic.contains("terminated abnormally with status 0x"));
}

#[test]
#[serial]
fn test_stdio_redirected_to_files() {
    let (dir, exe) = setup("read line\necho \"got $line\"", "hello\n");
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    assert_eq!(verdict.outcome, ExecutionOutcome::Success);
    let output = fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(output, "got hello\n");
}

#[test]
#[serial]
fn test_child_runs_in_work_dir() {
    let (dir, exe) = setup("cat marker.txt", "");
    fs::write(dir.path().join("marker.txt"), "here").unwrap();
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    assert_eq!(verdict.outcome, ExecutionOutcome::Success);
    assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "here");
}

#[test]
#[serial]
fn test_missing_input_is_system_error() {
    let (dir, exe) = setup("exit 0", "");
    fs::remove_file(dir.path().join("in.txt")).unwrap();
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    match &verdict.outcome {
        ExecutionOutcome::SystemError(message) => assert!(message.contains("open input")),
        other => panic!("expected system_error, got {:?}", other),
    }
    assert_eq!(verdict.exit_code, 1);
}

#[test]
#[serial]
fn test_missing_executable_is_system_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("in.txt"), "").unwrap();
    let exe = dir.path().join("missing");
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    assert!(matches!(verdict.outcome, ExecutionOutcome::SystemError(_)));
    assert_eq!(verdict.exit_code, 1);
}

#[test]
#[serial]
fn test_non_executable_is_system_error() {
    let (dir, exe) = setup("exit 0", "");
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o644)).unwrap();
    let verdict = supervise(
        &PosixSupervisor::default(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 5),
    );

    match &verdict.outcome {
        ExecutionOutcome::SystemError(message) => assert!(message.contains("execv")),
        other => panic!("expected system_error, got {:?}", other),
    }
}

extern "C" fn marker_handler(_signo: libc::c_int) {}

#[test]
#[serial]
fn test_polling_wait_restores_sigchld() {
    let marker = SigAction::new(
        SigHandler::Handler(marker_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let original = unsafe { sigaction(Signal::SIGCHLD, &marker) }.unwrap();

    let (dir, exe) = setup("exit 3", "");
    let supervisor = PosixSupervisor::polling();
    assert_eq!(supervisor.strategy(), WaitStrategy::Polling);
    let verdict = supervise(&supervisor, &spec_in(dir.path(), &exe), &LimitConfig::new(64 * MIB, 5));
    assert_eq!(verdict.outcome, ExecutionOutcome::NonZeroExit(3));

    let current = unsafe { sigaction(Signal::SIGCHLD, &original) }.unwrap();
    assert_eq!(current.handler(), SigHandler::Handler(marker_handler));
}

#[test]
#[serial]
fn test_inherited_ignored_sigchld() {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let original = unsafe { sigaction(Signal::SIGCHLD, &ignore) }.unwrap();

    let (dir, exe) = setup("exit 0", "");
    let spec = spec_in(dir.path(), &exe);
    let limits = LimitConfig::new(64 * MIB, 5);
    let native = supervise(&PosixSupervisor::default(), &spec, &limits);
    let polling = supervise(&PosixSupervisor::polling(), &spec, &limits);

    let current = unsafe { sigaction(Signal::SIGCHLD, &original) }.unwrap();
    assert_eq!(native.outcome, ExecutionOutcome::Success);
    assert_eq!(polling.outcome, ExecutionOutcome::Success);
    assert_eq!(current.handler(), SigHandler::SigIgn);
}

#[test]
#[serial]
fn test_polling_wait_times_out() {
    let (dir, exe) = setup("while :; do :; done", "");
    let verdict = supervise(
        &PosixSupervisor::polling(),
        &spec_in(dir.path(), &exe),
        &LimitConfig::new(64 * MIB, 1),
    );

    assert_eq!(verdict.outcome, ExecutionOutcome::TimedOut);
}
