//! Execution control
//!
//! The runner clones the child and waits for it; the child walks the
//! type-state setup chain in [`preexec`] up to `execve`.

pub mod preexec;
pub mod runner;
pub mod tracer;

pub use runner::{NamespaceRunner, Runner};
