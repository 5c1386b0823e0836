//! Filesystem isolation and mount management
//!
//! A [`plan::MountPlan`] is built and validated in the parent; the child
//! applies it through [`filesystem::PreparedRoot`].

pub mod filesystem;
pub mod plan;

pub use filesystem::PreparedRoot;
pub use plan::{MountEntry, MountKind, MountPlan, MountPlanBuilder, MountPlanError};
