//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Functions documented as child side run between `clone` and `execve`:
//! they neither allocate nor log.

pub mod cgroup;
pub mod mount;
pub mod namespace;
pub mod rlimit;
pub mod seccomp;
pub mod signal;
pub mod syscalls;
