//! Ordered mount plan for the sandbox root.
//!
//! Destinations are relative to the new root. Bind entries whose host source
//! is missing can be dropped at build time; every other problem is collected
//! and reported together.

use crate::config::types::SandboxError;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Tmpfs,
    Proc,
}

/// One mount inside the new root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Host path for binds; filesystem name otherwise
    pub source: PathBuf,
    /// Relative to the sandbox root
    pub destination: PathBuf,
    pub readonly: bool,
    pub kind: MountKind,
    /// Filesystem data string, e.g. tmpfs `size=`
    pub options: Option<String>,
}

impl MountEntry {
    pub fn bind(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        readonly: bool,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            readonly,
            kind: MountKind::Bind,
            options: None,
        }
    }

    pub fn tmpfs(destination: impl Into<PathBuf>, options: Option<&str>) -> Self {
        Self {
            source: PathBuf::from("tmpfs"),
            destination: destination.into(),
            readonly: false,
            kind: MountKind::Tmpfs,
            options: options.map(str::to_string),
        }
    }

    pub fn proc(readonly: bool) -> Self {
        Self {
            source: PathBuf::from("proc"),
            destination: PathBuf::from("proc"),
            readonly,
            kind: MountKind::Proc,
            options: None,
        }
    }
}

/// An entry that cannot be mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedMount {
    pub destination: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for RejectedMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.destination.display(), self.reason)
    }
}

/// Every rejected entry of a plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid mount plan ({} rejected): {}", .rejected.len(), render(.rejected))]
pub struct MountPlanError {
    pub rejected: Vec<RejectedMount>,
}

fn render(rejected: &[RejectedMount]) -> String {
    rejected
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<MountPlanError> for SandboxError {
    fn from(err: MountPlanError) -> Self {
        SandboxError::Mount(err.to_string())
    }
}

/// Immutable, validated plan. Process filesystem entries always come last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    entries: Vec<MountEntry>,
}

impl MountPlan {
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn contains_destination(&self, destination: &Path) -> bool {
        let destination = relative(destination);
        self.entries.iter().any(|e| e.destination == destination)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountPlanBuilder {
    entries: Vec<MountEntry>,
    filter_not_exist: bool,
}

impl MountPlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a host path. A leading `/` on the destination is ignored.
    pub fn with_bind(
        mut self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        readonly: bool,
    ) -> Self {
        self.entries.push(MountEntry::bind(source, destination, readonly));
        self
    }

    /// Bind each host path at the same location inside the sandbox.
    pub fn with_binds<I, P>(mut self, paths: I, readonly: bool) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            let path = path.as_ref();
            self.entries.push(MountEntry::bind(path, relative(path), readonly));
        }
        self
    }

    pub fn with_tmpfs(mut self, destination: impl Into<PathBuf>, options: &str) -> Self {
        let options = (!options.is_empty()).then_some(options);
        self.entries.push(MountEntry::tmpfs(destination, options));
        self
    }

    /// Read-only `/proc` for the new pid namespace.
    pub fn with_proc(mut self) -> Self {
        self.entries.push(MountEntry::proc(true));
        self
    }

    pub fn with_proc_rw(mut self) -> Self {
        self.entries.push(MountEntry::proc(false));
        self
    }

    /// Drop bind entries whose host source does not exist.
    pub fn filter_not_exist(mut self) -> Self {
        self.filter_not_exist = true;
        self
    }

    pub fn build(self) -> Result<MountPlan, MountPlanError> {
        let mut rejected = Vec::new();
        let mut entries = Vec::with_capacity(self.entries.len());
        let mut proc_entry = None;

        for mut entry in self.entries {
            entry.destination = relative(&entry.destination);

            if let Some(reason) = invalid_reason(&entry) {
                rejected.push(RejectedMount {
                    destination: entry.destination,
                    reason,
                });
                continue;
            }

            if entry.kind == MountKind::Bind && !entry.source.exists() {
                if self.filter_not_exist {
                    log::debug!("Dropping bind of missing host path {}", entry.source.display());
                    continue;
                }
                rejected.push(RejectedMount {
                    reason: format!("host path {} does not exist", entry.source.display()),
                    destination: entry.destination,
                });
                continue;
            }

            if entry.kind == MountKind::Proc {
                // Last request wins.
                proc_entry = Some(entry);
            } else {
                entries.push(entry);
            }
        }

        if !rejected.is_empty() {
            return Err(MountPlanError { rejected });
        }
        entries.extend(proc_entry);
        Ok(MountPlan { entries })
    }
}

/// Strip any root prefix so the path is relative to the sandbox root.
fn relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .collect()
}

fn invalid_reason(entry: &MountEntry) -> Option<String> {
    if entry.destination.as_os_str().is_empty() {
        return Some("destination is the sandbox root".to_string());
    }
    if entry
        .destination
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Some("destination escapes the sandbox root".to_string());
    }
    if has_nul(&entry.destination) || has_nul(&entry.source) {
        return Some("path contains NUL byte".to_string());
    }
    if entry.options.as_deref().is_some_and(|o| o.contains('\0')) {
        return Some("options contain NUL byte".to_string());
    }
    if entry.kind == MountKind::Bind && !entry.source.is_absolute() {
        return Some(format!("bind source {} is not absolute", entry.source.display()));
    }
    None
}

fn has_nul(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sources_are_dropped_when_filtering() {
        let plan = MountPlanBuilder::new()
            .with_binds(["/definitely/not/here", "/"], true)
            .with_bind("/also/missing", "data", true)
            .filter_not_exist()
            .build();
        // "/" binds onto the root itself and is rejected.
        let err = plan.unwrap_err();
        assert_eq!(err.rejected.len(), 1);

        let plan = MountPlanBuilder::new()
            .with_binds(["/definitely/not/here", "/tmp"], true)
            .filter_not_exist()
            .build()
            .unwrap();
        assert_eq!(plan.entries().len(), 1);
        assert_eq!(plan.entries()[0].destination, PathBuf::from("tmp"));
    }

    #[test]
    fn missing_sources_are_errors_without_filtering() {
        let err = MountPlanBuilder::new()
            .with_bind("/definitely/not/here", "x", true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn all_rejections_reported_together() {
        let err = MountPlanBuilder::new()
            .with_bind("relative/source", "a", true)
            .with_bind("/tmp", "../escape", true)
            .with_tmpfs("", "size=1m")
            .build()
            .unwrap_err();
        assert_eq!(err.rejected.len(), 3);
        let message = err.to_string();
        assert!(message.contains("not absolute"));
        assert!(message.contains("escapes"));
        assert!(message.contains("sandbox root"));
    }

    #[test]
    fn proc_always_comes_last() {
        let plan = MountPlanBuilder::new()
            .with_proc()
            .with_tmpfs("tmp", "size=8m")
            .with_bind("/tmp", "/host-tmp", false)
            .build()
            .unwrap();
        let kinds: Vec<_> = plan.entries().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![MountKind::Tmpfs, MountKind::Bind, MountKind::Proc]);
        assert!(plan.entries()[2].readonly);
    }

    #[test]
    fn read_write_proc_overrides() {
        let plan = MountPlanBuilder::new().with_proc().with_proc_rw().build().unwrap();
        assert_eq!(plan.entries().len(), 1);
        assert!(!plan.entries()[0].readonly);
    }

    #[test]
    fn destinations_are_made_relative() {
        let plan = MountPlanBuilder::new()
            .with_bind("/tmp", "/work/./data", false)
            .build()
            .unwrap();
        assert_eq!(plan.entries()[0].destination, PathBuf::from("work/data"));
        assert!(plan.contains_destination(Path::new("/work/data")));
    }
}
