//! Child-side setup chain between `clone` and `execve`.
//!
//! The sequence is fixed and encoded in the type system:
//!
//! 1. `setsid()` and parent death signal
//! 2. wait for the parent to attach the controller group
//! 3. mount propagation hardening
//! 4. sandbox root assembly and `pivot_root`
//! 5. hostname, stdio redirection, POSIX limits
//! 6. `no_new_privs` (and `PTRACE_TRACEME` when traced)
//! 7. syscall filter
//! 8. `execve`
//!
//! Each step consumes the previous state and returns the next one, so steps
//! cannot be skipped or reordered:
//!
//! ```compile_fail
//! use runbox::exec::preexec::{ChildSetup, Fresh};
//! use runbox::kernel::seccomp::FilterProgram;
//!
//! // The filter cannot be installed before the root is entered.
//! fn early_filter(setup: ChildSetup<Fresh>, filter: &FilterProgram) {
//!     let _ = setup.install_filter(filter);
//! }
//! ```
//!
//! ```compile_fail
//! use runbox::exec::preexec::{ChildSetup, Released, ExecImage};
//!
//! // Exec is only reachable once the filter is installed.
//! fn early_exec(setup: ChildSetup<Released>, image: &ExecImage) {
//!     let _ = setup.exec(image);
//! }
//! ```
//!
//! ```compile_fail
//! use runbox::exec::preexec::{ChildSetup, Released};
//!
//! // A consumed state cannot be reused.
//! fn reuse(setup: ChildSetup<Released>) {
//!     let _ = setup.harden_mounts();
//!     let _ = setup.harden_mounts();
//! }
//! ```
//!
//! Nothing here allocates, locks or logs: the child of a multi-threaded
//! parent may only issue async-signal-safe calls. Failures are reported to
//! the parent as a [`ChildFailure`] on a close-on-exec pipe.

use crate::kernel::mount::PreparedRoot;
use crate::kernel::namespace::{harden_mount_propagation, UtsIdentity};
use crate::kernel::rlimit::PosixLimits;
use crate::kernel::seccomp::FilterProgram;
use nix::errno::Errno;
use std::ffi::{CString, NulError};
use std::marker::PhantomData;
use std::os::unix::io::RawFd;

/// Setup step a child failure happened in.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStage {
    Session = 1,
    ParentDeath = 2,
    Release = 3,
    MountPropagation = 4,
    Root = 5,
    Hostname = 6,
    Stdio = 7,
    Rlimit = 8,
    NoNewPrivs = 9,
    Trace = 10,
    Filter = 11,
    Exec = 12,
}

impl ChildStage {
    fn from_raw(raw: u32) -> Option<Self> {
        use ChildStage::*;
        [
            Session,
            ParentDeath,
            Release,
            MountPropagation,
            Root,
            Hostname,
            Stdio,
            Rlimit,
            NoNewPrivs,
            Trace,
            Filter,
            Exec,
        ]
        .into_iter()
        .find(|stage| *stage as u32 == raw)
    }

    pub fn describe(self) -> &'static str {
        match self {
            ChildStage::Session => "creating session",
            ChildStage::ParentDeath => "setting parent death signal",
            ChildStage::Release => "waiting for controller attach",
            ChildStage::MountPropagation => "making mounts private",
            ChildStage::Root => "assembling sandbox root",
            ChildStage::Hostname => "setting hostname",
            ChildStage::Stdio => "redirecting stdio",
            ChildStage::Rlimit => "applying POSIX limits",
            ChildStage::NoNewPrivs => "setting no_new_privs",
            ChildStage::Trace => "requesting trace",
            ChildStage::Filter => "installing syscall filter",
            ChildStage::Exec => "executing program",
        }
    }
}

/// A failed setup step, as sent over the error pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildFailure {
    pub stage: ChildStage,
    pub errno: Errno,
}

impl ChildFailure {
    pub const WIRE_SIZE: usize = 8;

    pub fn new(stage: ChildStage, errno: Errno) -> Self {
        Self { stage, errno }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[..4].copy_from_slice(&(self.stage as u32).to_ne_bytes());
        buf[4..].copy_from_slice(&(self.errno as i32).to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Option<Self> {
        let stage = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let errno = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(Self::new(ChildStage::from_raw(stage)?, Errno::from_i32(errno)))
    }

    /// Best effort: the parent treats a missing report as an early death.
    fn report(&self, fd: RawFd) {
        let buf = self.encode();
        // SAFETY: `buf` is a valid 8-byte buffer; a short or failed write
        // is reported by the parent as a truncated message.
        unsafe {
            libc::write(fd, buf.as_ptr().cast(), buf.len());
        }
    }
}

impl std::fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage.describe(), self.errno.desc())
    }
}

type Step<T> = std::result::Result<T, ChildFailure>;

fn check(stage: ChildStage, result: nix::Result<()>) -> Step<()> {
    result.map_err(|errno| ChildFailure::new(stage, errno))
}

fn check_ret(stage: ChildStage, ret: libc::c_int) -> Step<()> {
    check(stage, Errno::result(ret).map(drop))
}

/// Program path candidates, argv and envp, fully built before `clone`.
#[derive(Debug)]
pub struct ExecImage {
    candidates: Vec<CString>,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
}

impl ExecImage {
    /// `argv[0]` without a `/` is looked up in the `PATH` entry of `env`,
    /// inside the sandbox, at exec time.
    pub fn new(argv: &[String], env: &[String]) -> Result<Self, NulError> {
        let program = argv.first().map(String::as_str).unwrap_or_default();
        let candidates = if program.contains('/') {
            vec![CString::new(program)?]
        } else {
            let path = env
                .iter()
                .rev()
                .find_map(|entry| entry.strip_prefix("PATH="))
                .unwrap_or_default();
            path.split(':')
                .filter(|dir| !dir.is_empty())
                .map(|dir| CString::new(format!("{}/{}", dir.trim_end_matches('/'), program)))
                .collect::<Result<Vec<_>, _>>()?
        };

        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = env
            .iter()
            .map(|entry| CString::new(entry.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            candidates,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
        })
    }

    pub fn candidates(&self) -> &[CString] {
        &self.candidates
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn envp(&self) -> &[CString] {
        &self.envp
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Everything the child needs, borrowed from the parent's address space.
pub struct ChildContext<'a> {
    pub release_fd: RawFd,
    pub error_fd: RawFd,
    pub root: &'a PreparedRoot,
    pub uts: &'a UtsIdentity,
    pub stdio: [RawFd; 3],
    pub limits: &'a PosixLimits,
    pub filter: &'a FilterProgram,
    pub trace: bool,
    pub image: &'a ExecImage,
}

// Type-state markers
pub struct Fresh;
pub struct Released;
pub struct MountsPrivate;
pub struct RootEntered;
pub struct Configured;
pub struct PrivsLocked;
pub struct ExecReady;

/// The child process at one point of the setup chain.
pub struct ChildSetup<S> {
    _state: PhantomData<S>,
}

impl<S> ChildSetup<S> {
    fn next<T>(self) -> ChildSetup<T> {
        ChildSetup {
            _state: PhantomData,
        }
    }
}

impl ChildSetup<Fresh> {
    /// Lead a new session (so the whole group can be killed by pgid) and die
    /// with the parent.
    pub fn begin() -> Step<Self> {
        // SAFETY: setsid has no memory-safety preconditions.
        check_ret(ChildStage::Session, unsafe { libc::setsid() }.min(0))?;
        // SAFETY: as above; the argument is a valid signal number.
        check_ret(ChildStage::ParentDeath, unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong)
        })?;
        Ok(ChildSetup {
            _state: PhantomData,
        })
    }

    /// Block until the parent has placed this process in its controller group.
    pub fn await_release(self, fd: RawFd) -> Step<ChildSetup<Released>> {
        let mut byte = 0u8;
        loop {
            // SAFETY: reads at most one byte into a valid buffer.
            let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
            match n {
                1 => break,
                // Parent went away without releasing us.
                0 => return Err(ChildFailure::new(ChildStage::Release, Errno::EPIPE)),
                _ if Errno::last() == Errno::EINTR => continue,
                _ => return Err(ChildFailure::new(ChildStage::Release, Errno::last())),
            }
        }
        // SAFETY: closing our copy of the release pipe.
        unsafe { libc::close(fd) };
        Ok(self.next())
    }
}

impl ChildSetup<Released> {
    pub fn harden_mounts(self) -> Step<ChildSetup<MountsPrivate>> {
        check(ChildStage::MountPropagation, harden_mount_propagation())?;
        Ok(self.next())
    }
}

impl ChildSetup<MountsPrivate> {
    pub fn enter_root(self, root: &PreparedRoot) -> Step<ChildSetup<RootEntered>> {
        check(ChildStage::Root, root.enter())?;
        Ok(self.next())
    }
}

impl ChildSetup<RootEntered> {
    /// Hostname, descriptors 0-2 and POSIX limits.
    pub fn configure(
        self,
        uts: &UtsIdentity,
        stdio: [RawFd; 3],
        limits: &PosixLimits,
    ) -> Step<ChildSetup<Configured>> {
        check(ChildStage::Hostname, uts.apply())?;
        for (target, fd) in stdio.into_iter().enumerate() {
            if fd != target as RawFd {
                // SAFETY: dup2 on descriptors owned by this process.
                check_ret(ChildStage::Stdio, unsafe { libc::dup2(fd, target as RawFd) }.min(0))?;
            }
        }
        check(ChildStage::Rlimit, limits.apply())?;
        Ok(self.next())
    }
}

impl ChildSetup<Configured> {
    /// Forbid privilege gain through exec. When traced, stop for the tracer
    /// before the filter exists so it can set its options first.
    pub fn lock_privileges(self, trace: bool) -> Step<ChildSetup<PrivsLocked>> {
        // SAFETY: prctl with integer arguments only.
        check_ret(ChildStage::NoNewPrivs, unsafe {
            libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0)
        })?;
        if trace {
            check(ChildStage::Trace, nix::sys::ptrace::traceme())?;
            // SAFETY: raising a stop signal on ourselves.
            check_ret(ChildStage::Trace, unsafe { libc::raise(libc::SIGSTOP) })?;
        }
        Ok(self.next())
    }
}

impl ChildSetup<PrivsLocked> {
    /// Last step before exec. From here on every syscall is filtered.
    pub fn install_filter(self, filter: &FilterProgram) -> Step<ChildSetup<ExecReady>> {
        check(ChildStage::Filter, filter.install())?;
        Ok(self.next())
    }
}

impl ChildSetup<ExecReady> {
    /// Try each program candidate in turn. Returns only on failure.
    pub fn exec(self, image: &ExecImage) -> ChildFailure {
        let mut errno = Errno::ENOENT;
        let mut denied = false;
        for path in &image.candidates {
            // SAFETY: all pointers reference NUL-terminated strings owned by
            // `image`, and both arrays end with a null pointer.
            unsafe {
                libc::execve(path.as_ptr(), image.argv_ptrs.as_ptr(), image.envp_ptrs.as_ptr());
            }
            errno = Errno::last();
            match errno {
                Errno::EACCES => denied = true,
                Errno::ENOENT | Errno::ENOTDIR => {}
                _ => return ChildFailure::new(ChildStage::Exec, errno),
            }
        }
        if denied {
            errno = Errno::EACCES;
        }
        ChildFailure::new(ChildStage::Exec, errno)
    }
}

/// Entry point of the cloned child. Never returns.
pub fn child_main(ctx: &ChildContext<'_>) -> ! {
    let failure = match run_chain(ctx) {
        Ok(never) => match never {},
        Err(failure) => failure,
    };
    failure.report(ctx.error_fd);
    // SAFETY: terminate without running parent-owned destructors.
    unsafe { libc::_exit(1) }
}

enum Never {}

fn run_chain(ctx: &ChildContext<'_>) -> Step<Never> {
    let ready = ChildSetup::begin()?
        .await_release(ctx.release_fd)?
        .harden_mounts()?
        .enter_root(ctx.root)?
        .configure(ctx.uts, ctx.stdio, ctx.limits)?
        .lock_privileges(ctx.trace)?
        .install_filter(ctx.filter)?;
    Err(ready.exec(ctx.image))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_wire_format_round_trips() {
        let failure = ChildFailure::new(ChildStage::Root, Errno::EPERM);
        assert_eq!(ChildFailure::decode(&failure.encode()), Some(failure));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let mut buf = ChildFailure::new(ChildStage::Exec, Errno::ENOENT).encode();
        buf[..4].copy_from_slice(&99u32.to_ne_bytes());
        assert_eq!(ChildFailure::decode(&buf), None);
    }

    #[test]
    fn failure_message_names_stage() {
        let failure = ChildFailure::new(ChildStage::Exec, Errno::ENOENT);
        let message = failure.to_string();
        assert!(message.starts_with("executing program"));
        assert!(message.contains("No such file"));
    }

    #[test]
    fn bare_program_is_searched_in_path() {
        let image = ExecImage::new(
            &["sh".to_string(), "-c".to_string(), "true".to_string()],
            &["PATH=/usr/local/bin:/usr/bin/:/bin".to_string()],
        )
        .unwrap();
        let candidates: Vec<_> = image.candidates().iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(candidates, ["/usr/local/bin/sh", "/usr/bin/sh", "/bin/sh"]);
        assert_eq!(image.argv().len(), 3);
        assert_eq!(image.argv_ptrs.len(), 4);
        assert!(image.argv_ptrs[3].is_null());
    }

    #[test]
    fn later_path_entry_wins() {
        let image = ExecImage::new(
            &["tool".to_string()],
            &["PATH=/bin".to_string(), "PATH=/opt/bin".to_string()],
        )
        .unwrap();
        assert_eq!(image.candidates()[0].to_str().unwrap(), "/opt/bin/tool");
    }

    #[test]
    fn program_with_slash_is_used_verbatim() {
        let image = ExecImage::new(&["./a.out".to_string()], &[]).unwrap();
        assert_eq!(image.candidates().len(), 1);
        assert_eq!(image.candidates()[0].to_str().unwrap(), "./a.out");
        assert!(image.envp().is_empty());
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        assert!(ExecImage::new(&["/bin/echo".to_string(), "a\0b".to_string()], &[]).is_err());
    }
}
