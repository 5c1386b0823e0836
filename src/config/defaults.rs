//! Static default values handed to the filter builder, mount planner and
//! supervisor.
//!
//! [`SandboxSpec::build`] copies what it needs into the immutable spec.
//!
//! [`SandboxSpec::build`]: crate::config::spec::SandboxSpec::build

/// UTS hostname and domain name of every sandbox
pub const DEFAULT_HOSTNAME: &str = "runbox-sandbox";

/// Working directory of the sandboxed program
pub const WORK_DIR: &str = "/work";

/// Longest spawn-to-exec handoff the supervisor waits for
pub const SETUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Parent controller group of every run
pub const CGROUP_PARENT: &str = "runbox";

pub const DEFAULT_ENV: &[&str] = &["PATH=/usr/local/bin:/usr/bin:/bin"];

/// Scratch tmpfs mounted at `/tmp`
pub const TMPFS_DESTINATION: &str = "tmp";
pub const TMPFS_OPTIONS: &str = "size=8m,nr_inodes=4k";

/// Host directories exposed read-only to every program
pub const READONLY_BINDS: &[&str] = &[
    "/usr",
    "/bin",
    "/lib",
    "/lib64",
    "/lib32",
    "/etc/alternatives",
];

/// Host files exposed read-write to every program
pub const READWRITE_BINDS: &[&str] = &["/dev/null"];

/// Paths hidden inside the sandbox
pub const MASK_PATHS: &[&str] = &[
    "/sys/firmware",
    "/sys/devices/virtual/powercap",
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/usr/lib/wsl/drivers",
    "/usr/lib/wsl/lib",
];

/// Syscalls allowed when the filter is enforcing
pub const ALLOW_SYSCALLS: &[&str] = &[
    // file access through fd
    "read",
    "write",
    "readv",
    "writev",
    "close",
    "fstat",
    "lseek",
    "dup",
    "dup2",
    "dup3",
    "ioctl",
    "fcntl",
    "fadvise64",
    "pread64",
    "pwrite64",
    // memory
    "mmap",
    "mprotect",
    "munmap",
    "brk",
    "mremap",
    "msync",
    "mincore",
    "madvise",
    // signals
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "rt_sigpending",
    "sigaltstack",
    // path based, needed by dynamic loaders
    "openat",
    "unlinkat",
    "readlinkat",
    "faccessat",
    "newfstatat",
    "open",
    "unlink",
    "readlink",
    "lstat",
    "stat",
    "access",
    // process
    "execve",
    "execveat",
    "exit",
    "exit_group",
    "arch_prctl",
    "set_tid_address",
    "set_robust_list",
    "rseq",
    "prlimit64",
    "getrandom",
    // time and accounting
    "getcwd",
    "gettimeofday",
    "getrlimit",
    "getrusage",
    "times",
    "time",
    "clock_gettime",
    "restart_syscall",
];

/// Added to the allow list when process creation is permitted
pub const PROCESS_SYSCALLS: &[&str] = &["clone", "fork", "vfork", "nanosleep", "execve"];

pub fn default_env() -> Vec<String> {
    DEFAULT_ENV.iter().map(|s| s.to_string()).collect()
}

pub fn default_allow_syscalls() -> Vec<String> {
    ALLOW_SYSCALLS.iter().map(|s| s.to_string()).collect()
}

pub fn default_mask_paths() -> Vec<std::path::PathBuf> {
    MASK_PATHS.iter().map(std::path::PathBuf::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allow_list_has_no_duplicates() {
        let unique: HashSet<_> = ALLOW_SYSCALLS.iter().collect();
        assert_eq!(unique.len(), ALLOW_SYSCALLS.len());
    }

    #[test]
    fn mask_paths_are_absolute() {
        assert!(default_mask_paths().iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn default_env_sets_path() {
        assert!(default_env().iter().any(|e| e.starts_with("PATH=")));
    }
}
