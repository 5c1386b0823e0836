//! Diagnostic syscall tracer.
//!
//! With tracing on, kill-list entries compile to `SECCOMP_RET_TRACE`, so a
//! forbidden syscall stops the tracee instead of killing it in the kernel.
//! The tracer names the syscall in the log and then kills the tracee, which
//! the classifier sees as an ordinary signal death.
//!
//! The tracer follows forks and clones. It waits on any child, so one
//! process must not trace two runs at once.

use crate::config::types::{Result, SandboxError};
use crate::exec::runner::{wait4, WaitOutcome};
use crate::kernel::seccomp::traced_syscall;
use crate::kernel::syscalls;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

fn trace_options() -> Options {
    Options::PTRACE_O_TRACESECCOMP
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_EXITKILL
}

/// Set options at the child's self-inflicted `SIGSTOP` and let it go on.
///
/// Returns the wait outcome if the child terminated before stopping, which
/// happens when an earlier setup step failed.
pub(crate) fn handshake(root: Pid) -> Result<Option<WaitOutcome>> {
    loop {
        let outcome = wait4(root.as_raw(), libc::__WALL).map_err(|e| wait_error(root, e))?;
        if outcome.is_terminated() {
            return Ok(Some(outcome));
        }
        if !libc::WIFSTOPPED(outcome.status) {
            continue;
        }
        if libc::WSTOPSIG(outcome.status) == libc::SIGSTOP {
            match ptrace::setoptions(root, trace_options()) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(SandboxError::Process(format!(
                        "ptrace setoptions on {} failed: {}",
                        root, e
                    )))
                }
            }
            resume(root, None);
            log::debug!("Tracer attached to child {}", root);
            return Ok(None);
        }
        resume(root, signal_of(libc::WSTOPSIG(outcome.status)));
    }
}

/// Drive every tracee until the root child terminates, then reap the rest.
pub(crate) fn trace_until_exit(root: Pid) -> Result<WaitOutcome> {
    let mut root_exit = None;
    loop {
        let outcome = match wait4(-1, libc::__WALL) {
            Ok(outcome) => outcome,
            Err(Errno::ECHILD) => break,
            Err(e) => return Err(wait_error(root, e)),
        };

        if outcome.is_terminated() {
            if outcome.pid == root {
                root_exit = Some(outcome);
            }
            continue;
        }
        if libc::WIFSTOPPED(outcome.status) {
            handle_stop(outcome.pid, outcome.status);
        }
    }

    root_exit.ok_or_else(|| {
        SandboxError::Process(format!("traced child {} vanished without exit status", root))
    })
}

fn handle_stop(pid: Pid, status: libc::c_int) {
    let signal = libc::WSTOPSIG(status);
    let event = status >> 16;

    if signal == libc::SIGTRAP && event == libc::PTRACE_EVENT_SECCOMP {
        report_forbidden_syscall(pid);
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            log::warn!("Failed to kill tracee {}: {}", pid, e);
        }
        return;
    }

    if signal == libc::SIGTRAP && event != 0 {
        // fork, clone, vfork or exec event
        resume(pid, None);
        return;
    }

    if signal == libc::SIGSTOP {
        // Initial stop of a new tracee.
        resume(pid, None);
        return;
    }

    resume(pid, signal_of(signal));
}

fn report_forbidden_syscall(pid: Pid) {
    let data = match ptrace::getevent(pid) {
        Ok(data) => data as u32,
        Err(e) => {
            log::warn!("Tracee {} hit the syscall filter (event data unavailable: {})", pid, e);
            return;
        }
    };
    match traced_syscall(data) {
        Some(nr) => log::warn!(
            "Tracee {} invoked forbidden syscall {} ({})",
            pid,
            syscalls::name_of(nr).unwrap_or("unknown"),
            nr
        ),
        None => log::warn!("Tracee {} invoked a syscall outside the allow list", pid),
    }
}

fn resume(pid: Pid, signal: Option<Signal>) {
    match ptrace::cont(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to resume tracee {}: {}", pid, e),
    }
}

fn signal_of(raw: libc::c_int) -> Option<Signal> {
    Signal::try_from(raw).ok()
}

fn wait_error(root: Pid, e: Errno) -> SandboxError {
    SandboxError::Process(format!("waiting for traced child {} failed: {}", root, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_cover_descendants_and_filter_events() {
        let options = trace_options();
        assert!(options.contains(Options::PTRACE_O_TRACESECCOMP));
        assert!(options.contains(Options::PTRACE_O_TRACEFORK));
        assert!(options.contains(Options::PTRACE_O_TRACECLONE));
        assert!(options.contains(Options::PTRACE_O_EXITKILL));
    }

    #[test]
    fn raw_signal_numbers_convert() {
        assert_eq!(signal_of(libc::SIGUSR1), Some(Signal::SIGUSR1));
        assert_eq!(signal_of(0), None);
    }
}
