//! Sandboxed process runner
//!
//! Parent side of one run:
//!
//! 1. allocate a private temporary root and resolve the mount plan against it
//! 2. write controller ceilings
//! 3. `clone` the child into new namespaces
//! 4. attach the child to the controller group, then release it
//! 5. read the error pipe: a report is a setup failure, EOF is the exec handoff
//! 6. wait for termination (through the tracer when tracing)
//!
//! Setup time (spawn to handoff) and run time (handoff to termination) are
//! measured separately.

use crate::config::spec::SandboxSpec;
use crate::config::types::{Result, SandboxError};
use crate::core::types::{RawExit, RunControl};
use crate::exec::preexec::{child_main, ChildContext, ChildFailure, ExecImage};
use crate::exec::tracer;
use crate::kernel::mount::PreparedRoot;
use crate::kernel::signal::kill_group;
use crate::safety::workspace::TempRoot;
use nix::errno::Errno;
use nix::sched::clone;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Runs one sandboxed program to completion.
pub trait Runner: Send + Sync + 'static {
    /// Block until the child terminates or is killed through `control`.
    ///
    /// Errors are setup or wait failures; the program's own exit code or
    /// signal is part of the returned [`RawExit`].
    fn run(&self, spec: &SandboxSpec, control: &RunControl) -> Result<RawExit>;
}

/// Runner backed by `clone` with fresh namespaces.
#[derive(Debug, Clone)]
pub struct NamespaceRunner {
    temp_base: PathBuf,
}

impl NamespaceRunner {
    pub fn new() -> Self {
        Self::with_temp_base(std::env::temp_dir())
    }

    /// Create per-run roots under `base` instead of the system temp dir.
    pub fn with_temp_base(base: impl Into<PathBuf>) -> Self {
        Self {
            temp_base: base.into(),
        }
    }
}

impl Default for NamespaceRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for NamespaceRunner {
    fn run(&self, spec: &SandboxSpec, control: &RunControl) -> Result<RawExit> {
        let root = TempRoot::create_in(&self.temp_base)?;
        let prepared = PreparedRoot::prepare(
            root.path(),
            spec.mount_plan(),
            spec.mask_paths(),
            spec.work_dir(),
        )?;
        let image = ExecImage::new(spec.argv(), spec.env()).map_err(|e| {
            SandboxError::Config(format!("argv or env contains NUL byte: {}", e))
        })?;

        spec.controller().apply_limits(spec.controller_limits())?;

        let release = Pipe::new()?;
        let errors = Pipe::new()?;
        let ctx = ChildContext {
            release_fd: release.read.as_raw_fd(),
            error_fd: errors.write.as_raw_fd(),
            root: &prepared,
            uts: spec.uts(),
            stdio: spec.stdio().raw_fds(),
            limits: spec.posix_limits(),
            filter: spec.filter(),
            trace: spec.trace(),
            image: &image,
        };

        let spawned_at = Instant::now();
        let pid = spawn_child(spec, &ctx)?;
        let mut child = ChildGuard::new(pid, control);
        log::info!(
            "Spawned sandboxed child {} in namespaces {:?}",
            pid,
            spec.namespaces().names()
        );

        drop(release.read);
        drop(errors.write);

        if !control.arm(pid) {
            log::warn!("Run cancelled before child {} was released", pid);
        }

        spec.controller().attach(pid)?;
        release_child(release.write)?;

        let early_exit = if spec.trace() {
            tracer::handshake(pid)?
        } else {
            None
        };
        if early_exit.is_some() {
            child.reaped();
        }

        if let Some(failure) = read_child_failure(errors.read)? {
            return Err(SandboxError::Process(failure.to_string()));
        }
        if control.is_cancelled() {
            return Err(SandboxError::Process(
                "run cancelled before the program started".to_string(),
            ));
        }

        let started_at = Instant::now();
        control.mark_started(started_at);
        log::debug!(
            "Child {} handed off to program after {:?}",
            pid,
            started_at - spawned_at
        );

        let outcome = match early_exit {
            Some(outcome) => outcome,
            None if spec.trace() => tracer::trace_until_exit(pid)?,
            None => wait_child(pid)?,
        };
        let finished_at = Instant::now();
        child.reaped();

        let exit = outcome.into_raw_exit(started_at - spawned_at, finished_at - started_at);
        log::info!(
            "Child {} terminated: status={}, signal={:?}, run_time={:?}",
            pid,
            exit.exit_status,
            exit.signal,
            exit.run_time
        );

        root.cleanup()?;
        Ok(exit)
    }
}

fn spawn_child(spec: &SandboxSpec, ctx: &ChildContext<'_>) -> Result<Pid> {
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let child_cb: Box<dyn FnMut() -> isize + '_> = Box::new(|| -> isize { child_main(ctx) });

    // SAFETY: without CLONE_VM the child runs on a copy of the address
    // space; `child_main` never returns and only issues raw syscalls.
    unsafe { clone(child_cb, &mut stack, spec.namespaces().clone_flags(), Some(libc::SIGCHLD)) }
        .map_err(|e| SandboxError::Namespace(format!("clone failed: {}", e)))
}

fn release_child(fd: OwnedFd) -> Result<()> {
    match File::from(fd).write_all(&[1]) {
        Ok(()) => Ok(()),
        // The child died first; its report is on the error pipe.
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(SandboxError::Process(format!("Failed to release child: {}", e))),
    }
}

/// `None` on EOF, which means the program image replaced the child.
fn read_child_failure(fd: OwnedFd) -> Result<Option<ChildFailure>> {
    let mut file = File::from(fd);
    let mut buf = [0u8; ChildFailure::WIRE_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(SandboxError::Process(format!("Failed to read child report: {}", e)))
            }
        }
    }
    match filled {
        0 => Ok(None),
        ChildFailure::WIRE_SIZE => ChildFailure::decode(&buf).map(Some).ok_or_else(|| {
            SandboxError::Process("child sent an unrecognised failure report".to_string())
        }),
        n => Err(SandboxError::Process(format!("child failure report truncated to {} bytes", n))),
    }
}

/// Close-on-exec pipe.
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: pipe2 writes two descriptors into a valid array.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(SandboxError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: on success both descriptors are fresh and owned by us.
        Ok(Self {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }
}

/// Kills and reaps the child on early return so setup failures never leave
/// a process behind. Disarms the kill switch once the pid is gone.
struct ChildGuard<'a> {
    pid: Pid,
    control: &'a RunControl,
    reaped: bool,
}

impl<'a> ChildGuard<'a> {
    fn new(pid: Pid, control: &'a RunControl) -> Self {
        Self {
            pid,
            control,
            reaped: false,
        }
    }

    fn reaped(&mut self) {
        self.reaped = true;
        self.control.disarm();
    }
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        kill_group(self.pid);
        if let Err(e) = wait4(self.pid.as_raw(), libc::__WALL) {
            log::warn!("Failed to reap child {}: {}", self.pid, e);
        }
        self.control.disarm();
    }
}

/// Status and resource usage of one reaped (or stopped) process.
#[derive(Clone, Copy)]
pub(crate) struct WaitOutcome {
    pub pid: Pid,
    pub status: libc::c_int,
    pub rusage: libc::rusage,
}

impl WaitOutcome {
    pub fn is_terminated(&self) -> bool {
        libc::WIFEXITED(self.status) || libc::WIFSIGNALED(self.status)
    }

    pub fn into_raw_exit(self, setup_time: Duration, run_time: Duration) -> RawExit {
        let mut exit = if libc::WIFSIGNALED(self.status) {
            RawExit::signalled(libc::WTERMSIG(self.status))
        } else {
            RawExit::exited(libc::WEXITSTATUS(self.status))
        };
        exit.setup_time = setup_time;
        exit.run_time = run_time;
        exit.rusage_cpu = timeval(self.rusage.ru_utime) + timeval(self.rusage.ru_stime);
        // ru_maxrss is in KiB on Linux
        exit.rusage_max_rss = (self.rusage.ru_maxrss.max(0) as u64).saturating_mul(1024);
        exit
    }
}

impl std::fmt::Debug for WaitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitOutcome")
            .field("pid", &self.pid)
            .field("status", &self.status)
            .finish()
    }
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// `wait4` retrying on EINTR. `pid` may be -1 for any child.
pub(crate) fn wait4(pid: libc::pid_t, options: libc::c_int) -> nix::Result<WaitOutcome> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain old data and fully written by the kernel.
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: both out-pointers reference valid locals.
        let ret = unsafe { libc::wait4(pid, &mut status, options, &mut rusage) };
        match Errno::result(ret) {
            Ok(pid) => {
                return Ok(WaitOutcome {
                    pid: Pid::from_raw(pid),
                    status,
                    rusage,
                })
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn wait_child(pid: Pid) -> Result<WaitOutcome> {
    loop {
        let outcome = wait4(pid.as_raw(), libc::__WALL)
            .map_err(|e| SandboxError::Process(format!("wait4({}) failed: {}", pid, e)))?;
        if outcome.is_terminated() {
            return Ok(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::preexec::ChildStage;

    fn pipe_with(bytes: &[u8]) -> OwnedFd {
        let pipe = Pipe::new().unwrap();
        File::from(pipe.write).write_all(bytes).unwrap();
        pipe.read
    }

    #[test]
    fn eof_means_exec_handoff() {
        assert_eq!(read_child_failure(pipe_with(&[])).unwrap(), None);
    }

    #[test]
    fn report_is_decoded() {
        let failure = ChildFailure::new(ChildStage::Filter, Errno::EINVAL);
        let read = read_child_failure(pipe_with(&failure.encode())).unwrap();
        assert_eq!(read, Some(failure));
    }

    #[test]
    fn truncated_report_is_an_error() {
        assert!(read_child_failure(pipe_with(&[1, 0, 0])).is_err());
    }

    #[test]
    fn pipe_is_close_on_exec() {
        let pipe = Pipe::new().unwrap();
        // SAFETY: querying descriptor flags of an owned fd.
        let flags = unsafe { libc::fcntl(pipe.read.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn wait_decodes_exit_code_and_rusage() {
        let child = std::process::Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let outcome = wait_child(Pid::from_raw(child.id() as i32)).unwrap();
        let exit = outcome.into_raw_exit(Duration::ZERO, Duration::from_millis(5));
        assert_eq!(exit.exit_status, 7);
        assert_eq!(exit.signal, None);
        assert_eq!(exit.run_time, Duration::from_millis(5));
        assert!(exit.rusage_max_rss > 0);
    }

    #[test]
    fn wait_decodes_signal_death() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let exit = wait_child(pid).unwrap().into_raw_exit(Duration::ZERO, Duration::ZERO);
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert_eq!(exit.exit_status, libc::SIGKILL);
    }
}
