//! Cgroup backend abstraction for v1/v2 dual support.

use crate::config::types::{Result, SandboxError};
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Counters read once after the run. `None` means the kernel does not
/// provide that counter, which is not an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_time: Option<Duration>,
    pub memory_peak: Option<u64>,
    pub process_peak: Option<u64>,
}

/// Ceilings written to the group before the child is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerLimits {
    pub memory_bytes: u64,
    pub process_limit: u64,
    pub cpuset: Option<String>,
}

/// One controller group owned by a single run.
pub trait ResourceController: Send + Sync {
    fn backend_name(&self) -> &str;
    fn path(&self) -> &Path;
    fn set_memory_limit(&self, limit_bytes: u64) -> Result<()>;
    fn set_process_limit(&self, limit: u64) -> Result<()>;
    fn set_cpuset(&self, cpus: &str) -> Result<()>;
    fn attach(&self, pid: Pid) -> Result<()>;
    fn usage(&self) -> Result<ResourceUsage>;
    /// SIGKILL every member of the group.
    fn kill_all(&self) -> Result<()>;
    /// Remove the group. Called at most once, by [`ControllerHandle`].
    fn destroy(&self) -> Result<()>;
}

/// Owner of a controller group: create, attach, read, destroy exactly once.
///
/// Destruction happens on the first call to [`destroy`](Self::destroy) or on
/// drop, whichever comes first.
pub struct ControllerHandle {
    inner: Box<dyn ResourceController>,
    destroyed: AtomicBool,
}

impl ControllerHandle {
    pub fn new(inner: Box<dyn ResourceController>) -> Self {
        Self {
            inner,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Create a uniquely named group under the `parent` group using the
    /// detected cgroup version.
    pub fn create(parent: &str) -> Result<Self> {
        let name = format!("{}-{}", parent, uuid::Uuid::new_v4());
        let backend: Box<dyn ResourceController> = match detect_cgroup_backend() {
            Some(CgroupBackendType::V2) => {
                Box::new(crate::kernel::cgroup::v2::CgroupV2::create(CGROUP_ROOT, parent, &name)?)
            }
            Some(CgroupBackendType::V1) => {
                Box::new(crate::kernel::cgroup::v1::CgroupV1::create(CGROUP_ROOT, parent, &name)?)
            }
            None => {
                return Err(SandboxError::Cgroup(
                    "No cgroup hierarchy found under /sys/fs/cgroup".to_string(),
                ))
            }
        };
        log::info!(
            "Created {} controller group at {}",
            backend.backend_name(),
            backend.path().display()
        );
        Ok(Self::new(backend))
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    pub fn apply_limits(&self, limits: &ControllerLimits) -> Result<()> {
        self.inner.set_memory_limit(limits.memory_bytes)?;
        self.inner.set_process_limit(limits.process_limit)?;
        if let Some(cpus) = limits.cpuset.as_deref() {
            self.inner.set_cpuset(cpus)?;
        }
        Ok(())
    }

    pub fn attach(&self, pid: Pid) -> Result<()> {
        self.inner.attach(pid)
    }

    pub fn usage(&self) -> Result<ResourceUsage> {
        self.inner.usage()
    }

    pub fn kill_all(&self) -> Result<()> {
        self.inner.kill_all()
    }

    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Destroying controller group {}", self.inner.path().display());
        self.inner.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::warn!("Failed to destroy controller group: {}", e);
        }
    }
}

impl std::fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("backend", &self.inner.backend_name())
            .field("path", &self.inner.path())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CgroupBackendType {
    V1,
    V2,
}

/// Detect available cgroup backend: v2 preferred, v1 fallback.
pub fn detect_cgroup_backend() -> Option<CgroupBackendType> {
    let root = Path::new(CGROUP_ROOT);
    if root.join("cgroup.controllers").exists() {
        return Some(CgroupBackendType::V2);
    }
    if root.join("memory").exists() && root.join("cpuacct").exists() {
        return Some(CgroupBackendType::V1);
    }
    None
}

pub fn backend_type_name(backend_type: CgroupBackendType) -> &'static str {
    match backend_type {
        CgroupBackendType::V1 => "cgroup_v1",
        CgroupBackendType::V2 => "cgroup_v2",
    }
}

/// Write a control file.
pub(crate) fn write_knob(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| {
        SandboxError::Cgroup(format!("Failed to write '{}' to {}: {}", value, path.display(), e))
    })
}

/// Read a single-number counter file. A missing file is `Ok(None)`.
pub(crate) fn read_counter(path: &Path) -> Result<Option<u64>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SandboxError::ResourceRead(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    parse_counter(path, content.trim()).map(Some)
}

/// Read `key value` lines (`cpu.stat`, `memory.stat`) and return `key`.
pub(crate) fn read_keyed_counter(path: &Path, key: &str) -> Result<Option<u64>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SandboxError::ResourceRead(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            let value = parts.next().unwrap_or_default();
            return parse_counter(path, value).map(Some);
        }
    }
    Ok(None)
}

fn parse_counter(path: &Path, value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|e| {
        SandboxError::ResourceRead(format!(
            "Failed to parse '{}' from {}: {}",
            value,
            path.display(),
            e
        ))
    })
}

/// Pids listed in a `cgroup.procs` file; a vanished group yields none.
pub(crate) fn read_pids(procs: &Path) -> Vec<Pid> {
    fs::read_to_string(procs)
        .map(|content| {
            content
                .lines()
                .filter_map(|line| line.trim().parse::<i32>().ok())
                .map(Pid::from_raw)
                .collect()
        })
        .unwrap_or_default()
}

/// Remove an (empty) group directory, waiting out the short window in which
/// the kernel still reports killed members.
pub(crate) fn remove_group_dir(path: &Path) -> Result<()> {
    const ATTEMPTS: u32 = 50;
    for attempt in 0..ATTEMPTS {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt + 1 < ATTEMPTS => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                return Err(SandboxError::Cgroup(format!(
                    "Failed to remove cgroup {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingController {
        destroys: Arc<AtomicUsize>,
        path: PathBuf,
    }

    impl ResourceController for CountingController {
        fn backend_name(&self) -> &str {
            "counting"
        }
        fn path(&self) -> &Path {
            &self.path
        }
        fn set_memory_limit(&self, _: u64) -> Result<()> {
            Ok(())
        }
        fn set_process_limit(&self, _: u64) -> Result<()> {
            Ok(())
        }
        fn set_cpuset(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn attach(&self, _: Pid) -> Result<()> {
            Ok(())
        }
        fn usage(&self) -> Result<ResourceUsage> {
            Ok(ResourceUsage::default())
        }
        fn kill_all(&self) -> Result<()> {
            Ok(())
        }
        fn destroy(&self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> (ControllerHandle, Arc<AtomicUsize>) {
        let destroys = Arc::new(AtomicUsize::new(0));
        let handle = ControllerHandle::new(Box::new(CountingController {
            destroys: destroys.clone(),
            path: PathBuf::from("/fake"),
        }));
        (handle, destroys)
    }

    #[test]
    fn destroy_runs_once_across_calls_and_drop() {
        let (handle, destroys) = counting();
        handle.destroy().unwrap();
        handle.destroy().unwrap();
        assert!(handle.is_destroyed());
        drop(handle);
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_destroys_when_never_called() {
        let (handle, destroys) = counting();
        drop(handle);
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_counter_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_counter(&dir.path().join("memory.peak")).unwrap(), None);
        assert_eq!(read_keyed_counter(&dir.path().join("cpu.stat"), "usage_usec").unwrap(), None);
    }

    #[test]
    fn malformed_counter_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.peak");
        fs::write(&path, "lots\n").unwrap();
        assert!(matches!(read_counter(&path), Err(SandboxError::ResourceRead(_))));
    }

    #[test]
    fn keyed_counter_finds_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu.stat");
        fs::write(&path, "usage_usec 1500\nuser_usec 1000\nsystem_usec 500\n").unwrap();
        assert_eq!(read_keyed_counter(&path, "usage_usec").unwrap(), Some(1500));
        assert_eq!(read_keyed_counter(&path, "nr_throttled").unwrap(), None);
    }

    #[test]
    fn test_backend_type_name() {
        assert_eq!(backend_type_name(CgroupBackendType::V1), "cgroup_v1");
        assert_eq!(backend_type_name(CgroupBackendType::V2), "cgroup_v2");
    }
}
