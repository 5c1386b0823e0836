//! Scoped resources released on every exit path.

pub mod workspace;

pub use workspace::TempRoot;
