/// Cgroup v2 (unified hierarchy) backend
///
/// Groups live at `<root>/<parent>/<name>`. The parent group holds no
/// processes, so it can delegate controllers to its children.
use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::{
    read_counter, read_keyed_counter, read_pids, remove_group_dir, write_knob, ResourceController,
    ResourceUsage,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONTROLLERS: &[&str] = &["cpu", "memory", "pids", "cpuset"];

/// Cgroup v2 backend
#[derive(Debug)]
pub struct CgroupV2 {
    path: PathBuf,
}

impl CgroupV2 {
    /// Create `<root>/<parent>/<name>` with memory, pids and cpuset delegated.
    pub fn create(root: &str, parent: &str, name: &str) -> Result<Self> {
        let root = PathBuf::from(root);
        let parent_path = root.join(parent);

        fs::create_dir_all(&parent_path).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to create cgroup {}: {}",
                parent_path.display(),
                e
            ))
        })?;

        enable_controllers(&root);
        enable_controllers(&parent_path);

        let path = parent_path.join(name);
        fs::create_dir(&path).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        Ok(Self { path })
    }

    /// Use an existing group directory as is.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn knob(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Delegate every available controller to the children of `group`.
/// Controllers the kernel refuses are skipped with a warning; a missing one
/// shows up later as a failed limit write.
fn enable_controllers(group: &Path) {
    let available = fs::read_to_string(group.join("cgroup.controllers")).unwrap_or_default();
    let enabled = fs::read_to_string(group.join("cgroup.subtree_control")).unwrap_or_default();

    for controller in CONTROLLERS {
        if !available.split_whitespace().any(|c| c == *controller)
            || enabled.split_whitespace().any(|c| c == *controller)
        {
            continue;
        }
        let subtree_control = group.join("cgroup.subtree_control");
        if let Err(e) = fs::write(subtree_control, format!("+{}", controller)) {
            log::warn!(
                "Failed to enable {} controller in {}: {}",
                controller,
                group.display(),
                e
            );
        }
    }
}

impl ResourceController for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        write_knob(&self.knob("memory.max"), &limit_bytes.to_string())?;
        // No swap: the memory limit is the whole budget.
        let swap = self.knob("memory.swap.max");
        if swap.exists() {
            write_knob(&swap, "0")?;
        }
        Ok(())
    }

    fn set_process_limit(&self, limit: u64) -> Result<()> {
        write_knob(&self.knob("pids.max"), &limit.to_string())
    }

    fn set_cpuset(&self, cpus: &str) -> Result<()> {
        write_knob(&self.knob("cpuset.cpus"), cpus)
    }

    fn attach(&self, pid: Pid) -> Result<()> {
        write_knob(&self.knob("cgroup.procs"), &pid.to_string())
    }

    fn usage(&self) -> Result<ResourceUsage> {
        let cpu_usec = read_keyed_counter(&self.knob("cpu.stat"), "usage_usec")?;
        Ok(ResourceUsage {
            cpu_time: cpu_usec.map(Duration::from_micros),
            // kernel 5.19+
            memory_peak: read_counter(&self.knob("memory.peak"))?,
            // kernel 6.1+
            process_peak: read_counter(&self.knob("pids.peak"))?,
        })
    }

    fn kill_all(&self) -> Result<()> {
        // cgroup.kill (kernel 5.14+) also catches processes forking mid-kill.
        let kill_file = self.knob("cgroup.kill");
        if kill_file.exists() {
            return write_knob(&kill_file, "1");
        }
        for pid in read_pids(&self.knob("cgroup.procs")) {
            let _ = kill(pid, Signal::SIGKILL);
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        if let Err(e) = self.kill_all() {
            log::warn!("Failed to kill remaining members of {}: {}", self.path.display(), e);
        }
        remove_group_dir(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_group() -> (tempfile::TempDir, CgroupV2) {
        let dir = tempfile::tempdir().unwrap();
        let group = CgroupV2::open(dir.path());
        (dir, group)
    }

    #[test]
    fn usage_reads_all_counters() {
        let (dir, group) = fake_group();
        fs::write(dir.path().join("cpu.stat"), "usage_usec 250000\nuser_usec 200000\n").unwrap();
        fs::write(dir.path().join("memory.peak"), "67108864\n").unwrap();
        fs::write(dir.path().join("pids.peak"), "3\n").unwrap();

        let usage = group.usage().unwrap();
        assert_eq!(usage.cpu_time, Some(Duration::from_millis(250)));
        assert_eq!(usage.memory_peak, Some(64 << 20));
        assert_eq!(usage.process_peak, Some(3));
    }

    #[test]
    fn usage_tolerates_old_kernels() {
        let (dir, group) = fake_group();
        fs::write(dir.path().join("cpu.stat"), "usage_usec 10\n").unwrap();

        let usage = group.usage().unwrap();
        assert_eq!(usage.cpu_time, Some(Duration::from_micros(10)));
        assert_eq!(usage.memory_peak, None);
        assert_eq!(usage.process_peak, None);
    }

    #[test]
    fn limits_are_written_to_knobs() {
        let (dir, group) = fake_group();
        group.set_memory_limit(1 << 20).unwrap();
        group.set_process_limit(4).unwrap();
        group.set_cpuset("0-1").unwrap();

        let read = |name: &str| fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("memory.max"), "1048576");
        assert_eq!(read("pids.max"), "4");
        assert_eq!(read("cpuset.cpus"), "0-1");
    }
}
