//! Windows backend
//!
//! The child is created suspended and broken away from any job the
//! supervisor itself runs in, then assigned to a fresh job object that caps
//! per-process memory, job memory and the number of active processes (one).
//! Only after membership is verified does the primary thread resume.

use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::path::Path;
use std::ptr;
use std::time::Duration;

use tracing::{debug, info, warn};
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPVOID, TRUE};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::SetHandleInformation;
use winapi::um::jobapi::IsProcessInJob;
use winapi::um::jobapi2::{
    AssignProcessToJobObject, CreateJobObjectW, QueryInformationJobObject,
    SetInformationJobObject,
};
use winapi::um::processenv::GetStdHandle;
use winapi::um::processthreadsapi::{
    CreateProcessW, GetExitCodeProcess, ResumeThread, TerminateProcess, PROCESS_INFORMATION,
    STARTUPINFOW,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{
    CREATE_BREAKAWAY_FROM_JOB, CREATE_SUSPENDED, HANDLE_FLAG_INHERIT, INFINITE,
    STARTF_USESTDHANDLES, STD_ERROR_HANDLE, WAIT_FAILED, WAIT_OBJECT_0,
};
use winapi::um::winnt::{
    JobObjectExtendedLimitInformation, HANDLE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_ACTIVE_PROCESS, JOB_OBJECT_LIMIT_JOB_MEMORY, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
};

use crate::config::LimitConfig;
use crate::error::SystemError;
use crate::outcome::{ResourceSample, TerminationKind, WaitResult};
use crate::runner::{LaunchSpec, Supervisor};

/// Exit codes at or above this value are exceptions, not exit codes
pub const CRASH_SENTINEL: u32 = 0x0800_0000;

/// Exit code handed to TerminateProcess
const KILLED_EXIT_CODE: u32 = 1;

/// Job object supervisor with a kernel-enforced memory ceiling
#[derive(Debug, Clone, Copy, Default)]
pub struct JobObjectSupervisor;

/// Suspended or running child, its job and its redirected stdio
///
/// `Drop` terminates a still-running process before its handles close.
pub struct JobObjectChild {
    process: OwnedHandle,
    thread: OwnedHandle,
    job: Option<OwnedHandle>,
    /// Baseline `PeakProcessMemoryUsed` captured before resume
    baseline_peak: u64,
    finished: bool,
    _stdin: File,
    _stdout: File,
}

impl JobObjectChild {
    fn raw_process(&self) -> HANDLE {
        self.process.as_raw_handle() as HANDLE
    }

    fn terminate(&mut self) -> Result<(), SystemError> {
        if self.finished {
            return Ok(());
        }
        // SAFETY: the process handle is open for the life of self
        if unsafe { TerminateProcess(self.raw_process(), KILLED_EXIT_CODE) } == FALSE {
            return Err(SystemError::last_os_error("TerminateProcess"));
        }
        // SAFETY: as above; the kill is asynchronous
        unsafe { WaitForSingleObject(self.raw_process(), INFINITE) };
        self.finished = true;
        Ok(())
    }

    fn peak_process_memory(&self) -> Result<u64, SystemError> {
        let job = match &self.job {
            Some(job) => job,
            None => return Ok(0),
        };
        let info = query_limits(job)?;
        Ok(info.PeakProcessMemoryUsed as u64)
    }
}

impl Drop for JobObjectChild {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            warn!("Failed to release child process: {}", err);
        }
    }
}

impl Supervisor for JobObjectSupervisor {
    type Child = JobObjectChild;

    fn launch(&self, spec: &LaunchSpec) -> Result<JobObjectChild, SystemError> {
        let stdin = OpenOptions::new()
            .read(true)
            .open(spec.input_path())
            .map_err(|e| SystemError::from_io("CreateFile", &e))?;
        let stdout = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(spec.output_path())
            .map_err(|e| SystemError::from_io("CreateFile", &e))?;
        make_inheritable(stdin.as_raw_handle())?;
        make_inheritable(stdout.as_raw_handle())?;

        // SAFETY: returns the supervisor's own stderr handle (possibly null)
        let stderr = unsafe { GetStdHandle(STD_ERROR_HANDLE) };

        // SAFETY: STARTUPINFOW is plain old data
        let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
        startup.cb = mem::size_of::<STARTUPINFOW>() as DWORD;
        startup.dwFlags = STARTF_USESTDHANDLES;
        startup.hStdInput = stdin.as_raw_handle() as HANDLE;
        startup.hStdOutput = stdout.as_raw_handle() as HANDLE;
        startup.hStdError = stderr;

        let application = to_wide(spec.executable.as_os_str());
        let mut command_line = quoted_command_line(&spec.executable);
        let current_dir = to_wide(spec.work_dir.as_os_str());
        // SAFETY: PROCESS_INFORMATION is plain old data
        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };

        // SAFETY: every pointer refers to a live, NUL-terminated buffer
        let created = unsafe {
            CreateProcessW(
                application.as_ptr(),
                command_line.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                TRUE,
                // otherwise the child stays in the job running the supervisor
                CREATE_SUSPENDED | CREATE_BREAKAWAY_FROM_JOB,
                ptr::null_mut(),
                current_dir.as_ptr(),
                &mut startup,
                &mut info,
            )
        };
        if created == FALSE {
            return Err(SystemError::last_os_error("CreateProcess"));
        }

        info!(
            "Spawned {:?} suspended as pid {}",
            spec.executable, info.dwProcessId
        );
        // SAFETY: CreateProcessW succeeded, both handles are ours to close
        Ok(JobObjectChild {
            process: unsafe { OwnedHandle::from_raw_handle(info.hProcess as RawHandle) },
            thread: unsafe { OwnedHandle::from_raw_handle(info.hThread as RawHandle) },
            job: None,
            baseline_peak: 0,
            finished: false,
            _stdin: stdin,
            _stdout: stdout,
        })
    }

    fn attach(&self, child: &mut JobObjectChild, limits: &LimitConfig) -> Result<(), SystemError> {
        // SAFETY: anonymous job with default security
        let raw_job = unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) };
        if raw_job.is_null() {
            return Err(SystemError::last_os_error("CreateJobObject"));
        }
        // SAFETY: freshly created handle, owned from here on
        let job = unsafe { OwnedHandle::from_raw_handle(raw_job as RawHandle) };

        let ceiling = usize::try_from(limits.memory_limit_bytes).unwrap_or(usize::MAX);
        // SAFETY: the structure is plain old data
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_PROCESS_MEMORY
            | JOB_OBJECT_LIMIT_JOB_MEMORY
            | JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
        info.BasicLimitInformation.ActiveProcessLimit = 1;
        info.ProcessMemoryLimit = ceiling;
        info.JobMemoryLimit = ceiling;

        // SAFETY: info lives across the call and matches the information class
        let set = unsafe {
            SetInformationJobObject(
                job.as_raw_handle() as HANDLE,
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as LPVOID,
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
            )
        };
        if set == FALSE {
            return Err(SystemError::last_os_error("SetInformationJobObject"));
        }

        // SAFETY: both handles are open
        if unsafe { AssignProcessToJobObject(job.as_raw_handle() as HANDLE, child.raw_process()) }
            == FALSE
        {
            return Err(SystemError::last_os_error("AssignProcessToJobObject"));
        }

        let mut in_job: BOOL = FALSE;
        // SAFETY: both handles are open, in_job outlives the call
        if unsafe { IsProcessInJob(child.raw_process(), job.as_raw_handle() as HANDLE, &mut in_job) }
            == FALSE
        {
            return Err(SystemError::last_os_error("IsProcessInJob"));
        }
        if in_job == FALSE {
            return Err(SystemError::new(
                "IsProcessInJob",
                "process is not a member of its job object",
            ));
        }

        child.baseline_peak = query_limits(&job)?.PeakProcessMemoryUsed as u64;
        child.job = Some(job);
        debug!(
            "Attached job object: ceiling {} bytes, baseline peak {} bytes",
            ceiling, child.baseline_peak
        );
        Ok(())
    }

    fn resume(&self, child: &mut JobObjectChild) -> Result<(), SystemError> {
        // SAFETY: the thread handle is open for the life of child
        if unsafe { ResumeThread(child.thread.as_raw_handle() as HANDLE) } == DWORD::MAX {
            return Err(SystemError::last_os_error("ResumeThread"));
        }
        Ok(())
    }

    fn wait(&self, child: &mut JobObjectChild, timeout: Duration) -> WaitResult {
        // INFINITE is reserved, stay one below it
        let timeout_ms = u32::try_from(timeout.as_millis())
            .unwrap_or(INFINITE - 1)
            .min(INFINITE - 1);

        // SAFETY: the process handle is open for the life of child
        match unsafe { WaitForSingleObject(child.raw_process(), timeout_ms) } {
            WAIT_OBJECT_0 => {
                child.finished = true;
                let mut code: DWORD = 0;
                // SAFETY: as above, code outlives the call
                if unsafe { GetExitCodeProcess(child.raw_process(), &mut code) } == FALSE {
                    return WaitResult::SystemError(SystemError::last_os_error(
                        "GetExitCodeProcess",
                    ));
                }
                let kind = if code >= CRASH_SENTINEL {
                    TerminationKind::Abnormal
                } else {
                    TerminationKind::Exited(code)
                };
                WaitResult::Completed {
                    raw_status: code,
                    kind,
                }
            }
            WAIT_TIMEOUT => {
                info!("Child exceeded {:?}, terminating", timeout);
                match child.terminate() {
                    Ok(()) => WaitResult::TimedOut,
                    Err(err) => WaitResult::SystemError(err),
                }
            }
            WAIT_FAILED => {
                let err = SystemError::last_os_error("WaitForSingleObject");
                kill_after_failure(child);
                WaitResult::SystemError(err)
            }
            other => {
                // WAIT_ABANDONED only applies to mutexes
                kill_after_failure(child);
                WaitResult::SystemError(SystemError::new(
                    "WaitForSingleObject",
                    format!("internal error: unexpected wait result 0x{:08x}", other),
                ))
            }
        }
    }

    fn sample(&self, child: &JobObjectChild) -> ResourceSample {
        let peak = match child.peak_process_memory() {
            Ok(peak) => peak,
            Err(err) => {
                warn!("Failed to sample job memory: {}", err);
                0
            }
        };
        ResourceSample {
            peak_memory_bytes: peak.saturating_sub(child.baseline_peak),
        }
    }
}

fn kill_after_failure(child: &mut JobObjectChild) {
    if let Err(err) = child.terminate() {
        warn!("Failed to terminate child after wait error: {}", err);
    }
}

fn query_limits(job: &OwnedHandle) -> Result<JOBOBJECT_EXTENDED_LIMIT_INFORMATION, SystemError> {
    // SAFETY: the structure is plain old data
    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
    // SAFETY: info lives across the call and matches the information class
    let ok = unsafe {
        QueryInformationJobObject(
            job.as_raw_handle() as HANDLE,
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as LPVOID,
            mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
            ptr::null_mut(),
        )
    };
    if ok == FALSE {
        return Err(SystemError::last_os_error("QueryInformationJobObject"));
    }
    Ok(info)
}

fn make_inheritable(handle: RawHandle) -> Result<(), SystemError> {
    // SAFETY: handle belongs to a File that outlives the child launch
    if unsafe { SetHandleInformation(handle as HANDLE, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT) }
        == FALSE
    {
        return Err(SystemError::last_os_error("SetHandleInformation"));
    }
    Ok(())
}

fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Command line holding only the quoted executable path
fn quoted_command_line(executable: &Path) -> Vec<u16> {
    let mut line: Vec<u16> = Vec::new();
    line.push(u16::from(b'"'));
    line.extend(executable.as_os_str().encode_wide());
    line.push(u16::from(b'"'));
    line.push(0);
    line
}
