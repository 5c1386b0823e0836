//! Run lifecycle: the supervisor and the facts it produces.

pub mod supervisor;
pub mod types;

pub use supervisor::{execute, Supervisor};
