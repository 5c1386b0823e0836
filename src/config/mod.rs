//! Configuration
//!
//! Mutable [`SandboxConfig`] in, immutable [`SandboxSpec`] out.

pub mod defaults;
pub mod spec;
pub mod types;
pub mod validator;

pub use spec::{SandboxSpec, StdioFiles};
pub use types::{BindPath, Limits, Result, SandboxConfig, SandboxError};
