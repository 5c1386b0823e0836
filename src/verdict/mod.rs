//! Verdict classification
//!
//! Derives verdicts as pure functions over execution facts.

pub mod verdict;

pub use verdict::{ResultRecord, Verdict, VerdictClassifier, VerdictStatus};
