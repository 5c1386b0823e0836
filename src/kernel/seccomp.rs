//! Syscall filter builder and BPF compiler.
//!
//! The compiled program has a fixed shape:
//!
//! 1. load `seccomp_data.arch`, kill the process on a foreign architecture
//! 2. load `seccomp_data.nr`
//! 3. one `JEQ nr` / `RET action` pair per listed syscall
//! 4. `RET default`
//!
//! Every jump offset is 0 or 1, so the program never needs long jumps no
//! matter how many syscalls are listed.
//!
//! A disabled filter still compiles to a (pass-through) program so that
//! installation is unconditional.

use crate::config::types::{Result, SandboxError};
use crate::kernel::syscalls;
use nix::errno::Errno;
use std::collections::BTreeMap;

const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// BPF opcodes
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;

// seccomp_data offsets
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_00b7;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("syscall filtering supports x86_64 and aarch64 only");

/// x32 ABI syscalls share the x86_64 audit arch; they are rejected outright.
#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// Kernel limit on classic BPF program length
const BPF_MAXINSNS: usize = 4096;

/// What happens when the sandboxed program issues a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Kill,
}

/// One classic BPF instruction, layout-compatible with `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

/// Collects allow and kill lists, then compiles them.
///
/// Kill entries win over allow entries naming the same syscall.
#[derive(Debug, Clone)]
pub struct FilterBuilder {
    allow: Vec<String>,
    kill: Vec<String>,
    default_action: FilterAction,
    trace: bool,
}

impl FilterBuilder {
    /// Allow-listing filter: unlisted syscalls kill the process.
    pub fn enforcing() -> Self {
        Self {
            allow: Vec::new(),
            kill: Vec::new(),
            default_action: FilterAction::Kill,
            trace: false,
        }
    }

    /// Filter that allows everything. Installed when enforcement is off.
    pub fn pass_through() -> Self {
        Self {
            default_action: FilterAction::Allow,
            ..Self::enforcing()
        }
    }

    pub fn allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn kill<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kill.extend(names.into_iter().map(Into::into));
        self
    }

    /// Report kills to an attached tracer (`SECCOMP_RET_TRACE`) instead of
    /// killing in the kernel.
    pub fn traced(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Resolve names and compile. Every unknown name is reported in one error.
    pub fn build(self) -> Result<FilterProgram> {
        let unknown: Vec<&str> = self
            .allow
            .iter()
            .chain(self.kill.iter())
            .map(String::as_str)
            .filter(|name| !syscalls::is_known(name))
            .collect();
        if !unknown.is_empty() {
            return Err(SandboxError::Filter(format!(
                "unknown syscall(s) for this architecture: {}",
                unknown.join(", ")
            )));
        }

        let mut actions = BTreeMap::new();
        for name in &self.allow {
            actions.insert(name.clone(), FilterAction::Allow);
        }
        for name in &self.kill {
            actions.insert(name.clone(), FilterAction::Kill);
        }
        // Entries matching the default action add nothing to the program.
        actions.retain(|_, action| *action != self.default_action);

        let program = FilterProgram::compile(actions, self.default_action, self.trace)?;
        log::debug!(
            "Compiled syscall filter: {} entries, default {:?}, {} instructions",
            program.actions.len(),
            program.default_action,
            program.instructions.len()
        );
        Ok(program)
    }
}

/// Immutable compiled filter.
#[derive(Debug, Clone)]
pub struct FilterProgram {
    actions: BTreeMap<String, FilterAction>,
    default_action: FilterAction,
    instructions: Vec<SockFilter>,
}

impl FilterProgram {
    fn compile(
        actions: BTreeMap<String, FilterAction>,
        default_action: FilterAction,
        trace: bool,
    ) -> Result<Self> {
        let mut instructions = vec![
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_CURRENT, 1, 0),
            SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
            SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR),
        ];

        #[cfg(target_arch = "x86_64")]
        {
            instructions.push(SockFilter::jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
            instructions.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
        }

        for (name, action) in &actions {
            let nr = syscalls::resolve(name)
                .ok_or_else(|| SandboxError::Filter(format!("unknown syscall: {}", name)))?;
            instructions.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1));
            instructions.push(SockFilter::stmt(BPF_RET | BPF_K, return_value(*action, nr, trace)));
        }

        // Unmatched syscalls carry no meaningful number for a tracer; use the
        // out-of-table marker so the tracer can tell them apart.
        instructions.push(SockFilter::stmt(
            BPF_RET | BPF_K,
            return_value(default_action, SECCOMP_RET_DATA, trace),
        ));

        if instructions.len() > BPF_MAXINSNS {
            return Err(SandboxError::Filter(format!(
                "filter too large: {} instructions (max {})",
                instructions.len(),
                BPF_MAXINSNS
            )));
        }

        Ok(Self {
            actions,
            default_action,
            instructions,
        })
    }

    /// Action taken for `name`.
    pub fn action_for(&self, name: &str) -> FilterAction {
        self.actions.get(name).copied().unwrap_or(self.default_action)
    }

    /// Short name of the filter's effect, for logs.
    pub fn mode(&self) -> &'static str {
        match (self.default_action, self.actions.is_empty()) {
            (FilterAction::Kill, _) => "enforcing",
            (FilterAction::Allow, true) => "pass-through",
            (FilterAction::Allow, false) => "kill-list only",
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.default_action == FilterAction::Allow && self.actions.is_empty()
    }

    pub fn instructions(&self) -> &[SockFilter] {
        &self.instructions
    }

    /// Install on the calling thread.
    ///
    /// Runs in the forked child: no allocation, no locks. `no_new_privs`
    /// must already be set.
    pub fn install(&self) -> nix::Result<()> {
        let prog = libc::sock_fprog {
            len: self.instructions.len() as libc::c_ushort,
            filter: self.instructions.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: `prog` points into `self.instructions`, which outlives the
        // call; the kernel copies the program before returning.
        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const libc::sock_fprog,
            )
        };
        Errno::result(ret).map(drop)
    }
}

fn return_value(action: FilterAction, nr: u32, trace: bool) -> u32 {
    match action {
        FilterAction::Allow => SECCOMP_RET_ALLOW,
        FilterAction::Kill if trace => SECCOMP_RET_TRACE | (nr & SECCOMP_RET_DATA),
        FilterAction::Kill => SECCOMP_RET_KILL_PROCESS,
    }
}

/// Syscall number carried by a `PTRACE_EVENT_SECCOMP` stop, or `None` when
/// the stop came from the default action.
pub fn traced_syscall(event_data: u32) -> Option<u32> {
    let nr = event_data & SECCOMP_RET_DATA;
    (nr != SECCOMP_RET_DATA).then_some(nr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_for(program: &FilterProgram, name: &str) -> Option<u32> {
        let nr = syscalls::resolve(name)?;
        program
            .instructions()
            .windows(2)
            .find(|pair| pair[0].code == BPF_JMP | BPF_JEQ | BPF_K && pair[0].k == nr)
            .map(|pair| pair[1].k)
    }

    #[test]
    fn kill_takes_precedence_over_allow() {
        let program = FilterBuilder::enforcing()
            .allow(["read", "write", "socket"])
            .kill(["socket"])
            .build()
            .unwrap();

        assert_eq!(program.action_for("read"), FilterAction::Allow);
        assert_eq!(program.action_for("socket"), FilterAction::Kill);
        assert_eq!(program.action_for("mount"), FilterAction::Kill);
        // Kill matches the default, so it needs no entry of its own.
        assert_eq!(ret_for(&program, "socket"), None);
        assert_eq!(ret_for(&program, "read"), Some(SECCOMP_RET_ALLOW));
    }

    #[test]
    fn kill_entries_compile_under_allow_default() {
        let program = FilterBuilder::pass_through()
            .kill(["ptrace"])
            .build()
            .unwrap();

        assert_eq!(program.action_for("read"), FilterAction::Allow);
        assert_eq!(ret_for(&program, "ptrace"), Some(SECCOMP_RET_KILL_PROCESS));
        assert_eq!(program.instructions().last().unwrap().k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn mode_names_what_the_filter_does() {
        assert_eq!(FilterBuilder::pass_through().build().unwrap().mode(), "pass-through");
        let kill_only = FilterBuilder::pass_through().kill(["ptrace"]).build().unwrap();
        assert_eq!(kill_only.mode(), "kill-list only");
        assert!(!kill_only.is_pass_through());
        let enforcing = FilterBuilder::enforcing().allow(["read"]).build().unwrap();
        assert_eq!(enforcing.mode(), "enforcing");
    }

    #[test]
    fn names_outside_default_lists_build() {
        let names = [
            "poll",
            "unshare",
            "chmod",
            "sendto",
            "epoll_create1",
            "socketpair",
            "setrlimit",
        ];
        let available: Vec<&str> =
            names.iter().copied().filter(|name| syscalls::is_known(name)).collect();
        #[cfg(target_arch = "x86_64")]
        assert_eq!(available.len(), names.len());

        let program = FilterBuilder::enforcing().allow(available.clone()).build().unwrap();
        let killed = FilterBuilder::pass_through().kill(available.clone()).build().unwrap();
        for name in available {
            assert_eq!(program.action_for(name), FilterAction::Allow);
            assert_eq!(killed.action_for(name), FilterAction::Kill);
            assert_eq!(ret_for(&killed, name), Some(SECCOMP_RET_KILL_PROCESS));
        }
    }

    #[test]
    fn pass_through_program_is_still_a_program() {
        let program = FilterBuilder::pass_through().build().unwrap();
        assert!(program.is_pass_through());
        assert!(!program.instructions().is_empty());
        assert_eq!(program.instructions().last().unwrap().k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn program_starts_with_arch_check() {
        let program = FilterBuilder::enforcing().allow(["read"]).build().unwrap();
        let insns = program.instructions();
        assert_eq!(insns[0].k, OFFSET_ARCH);
        assert_eq!(insns[1].k, AUDIT_ARCH_CURRENT);
        assert_eq!(insns[2].k, SECCOMP_RET_KILL_PROCESS);
        assert_eq!(insns[3].k, OFFSET_NR);
    }

    #[test]
    fn traced_kills_carry_syscall_number() {
        let program = FilterBuilder::pass_through()
            .kill(["socket"])
            .traced(true)
            .build()
            .unwrap();
        let nr = syscalls::resolve("socket").unwrap();
        let ret = ret_for(&program, "socket").unwrap();
        assert_eq!(ret & !SECCOMP_RET_DATA, SECCOMP_RET_TRACE);
        assert_eq!(traced_syscall(ret), Some(nr));
    }

    #[test]
    fn traced_default_has_no_syscall_number() {
        let program = FilterBuilder::enforcing().traced(true).build().unwrap();
        let ret = program.instructions().last().unwrap().k;
        assert_eq!(traced_syscall(ret), None);
    }

    #[test]
    fn unknown_names_are_reported_together() {
        let err = FilterBuilder::enforcing()
            .allow(["read", "frobnicate"])
            .kill(["teleport"])
            .build()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("frobnicate"));
        assert!(message.contains("teleport"));
    }

    #[test]
    fn jump_offsets_stay_short() {
        let all: Vec<&str> = crate::config::defaults::ALLOW_SYSCALLS
            .iter()
            .copied()
            .filter(|name| syscalls::is_known(name))
            .collect();
        let program = FilterBuilder::enforcing().allow(all).build().unwrap();
        assert!(program.instructions().iter().all(|i| i.jt <= 1 && i.jf <= 1));
    }
}
