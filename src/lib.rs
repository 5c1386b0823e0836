//! runbox: run one untrusted program under kernel-enforced isolation and
//! report a single verdict for it.
//!
//! # Architecture
//!
//! The crate is organized by Linux kernel primitive families:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: namespace set and UTS identity
//! - [`kernel::mount`]: mount planning and child-side root construction
//! - [`kernel::cgroup`]: resource controller groups (v1/v2 backends)
//! - [`kernel::seccomp`]: syscall filter builder and BPF compiler
//! - [`kernel::rlimit`]: POSIX limits derived from the configured limits
//! - [`kernel::signal`]: process-group kill switch and abort source
//!
//! ## Execution ([`exec`])
//! - [`exec::preexec`]: type-state child setup chain, ending in exec
//! - [`exec::runner`]: clone, synchronize, wait
//! - [`exec::tracer`]: optional ptrace diagnostics
//!
//! ## Lifecycle ([`core`])
//! - [`core::supervisor`](crate::core::supervisor): deadline and abort handling, facts assembly
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::verdict`]: classification and the result record
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: assembly config, limits and errors
//! - [`config::validator`]: up-front validation
//! - [`config::spec`]: the immutable per-run spec
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - facts come from wait status and controller counters
//! 2. **Types enforce order** - child setup steps cannot be reordered or skipped
//! 3. **Scoped cleanup** - controller groups and roots are released on every path
//! 4. **One record per run** - every failure folds into the verdict

// Kernel Primitives
pub mod kernel;

// Execution
pub mod exec;

// Run lifecycle
pub mod core;

// Verdict
pub mod verdict;

// Scoped resources
pub mod safety;

// Configuration
pub mod config;

// CLI entrypoint for the runbox binary
pub mod cli;

pub use config::types::{Limits, Result, SandboxConfig, SandboxError};
pub use crate::core::supervisor::{execute, Supervisor};
pub use verdict::{ResultRecord, Verdict, VerdictStatus};
