//! Cgroup v1 resource governance.
//!
//! One directory per controller hierarchy: memory, pids, cpuacct and,
//! when present, cpuset.

use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::{
    read_counter, read_pids, remove_group_dir, write_knob, ResourceController, ResourceUsage,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const REQUIRED: &[&str] = &["memory", "pids", "cpuacct"];
const OPTIONAL: &[&str] = &["cpuset"];

#[derive(Debug)]
pub struct CgroupV1 {
    /// (controller, group directory), in creation order
    groups: Vec<(&'static str, PathBuf)>,
}

impl CgroupV1 {
    pub fn create(root: &str, parent: &str, name: &str) -> Result<Self> {
        let root = Path::new(root);
        let mut group = Self { groups: Vec::new() };

        let controllers = REQUIRED
            .iter()
            .chain(OPTIONAL.iter().filter(|c| root.join(c).exists()));

        for controller in controllers {
            if let Err(e) = group.add_hierarchy(root, *controller, parent, name) {
                if let Err(cleanup) = group.destroy() {
                    log::warn!("Failed to clean up partial cgroup: {}", cleanup);
                }
                return Err(e);
            }
        }

        Ok(group)
    }

    fn add_hierarchy(
        &mut self,
        root: &Path,
        controller: &'static str,
        parent: &str,
        name: &str,
    ) -> Result<()> {
        let hierarchy = root.join(controller);
        let parent_path = hierarchy.join(parent);
        let path = parent_path.join(name);

        fs::create_dir_all(&parent_path)
            .and_then(|_| fs::create_dir(&path))
            .map_err(|e| {
                SandboxError::Cgroup(format!(
                    "Failed to create {} cgroup {}: {}",
                    controller,
                    path.display(),
                    e
                ))
            })?;
        self.groups.push((controller, path.clone()));

        if controller == "cpuset" {
            // A fresh cpuset group has no cpus or mems and rejects tasks.
            inherit_cpuset(&hierarchy, &parent_path)?;
            inherit_cpuset(&parent_path, &path)?;
        }
        Ok(())
    }

    /// Use existing group directories as is.
    pub fn open(groups: Vec<(&'static str, PathBuf)>) -> Self {
        Self { groups }
    }

    fn group(&self, controller: &str) -> Option<&Path> {
        self.groups
            .iter()
            .find(|(c, _)| *c == controller)
            .map(|(_, p)| p.as_path())
    }

    fn required(&self, controller: &str) -> Result<&Path> {
        self.group(controller).ok_or_else(|| {
            SandboxError::Cgroup(format!("cgroup v1 {} controller not available", controller))
        })
    }
}

fn inherit_cpuset(from: &Path, to: &Path) -> Result<()> {
    for knob in ["cpuset.cpus", "cpuset.mems"] {
        let current = fs::read_to_string(to.join(knob)).unwrap_or_default();
        if !current.trim().is_empty() {
            continue;
        }
        let value = fs::read_to_string(from.join(knob)).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to read {}: {}", from.join(knob).display(), e))
        })?;
        write_knob(&to.join(knob), value.trim())?;
    }
    Ok(())
}

impl ResourceController for CgroupV1 {
    fn backend_name(&self) -> &str {
        "cgroup_v1"
    }

    fn path(&self) -> &Path {
        self.group("memory")
            .or_else(|| self.groups.first().map(|(_, p)| p.as_path()))
            .unwrap_or_else(|| Path::new(""))
    }

    fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        let memory = self.required("memory")?;
        write_knob(&memory.join("memory.limit_in_bytes"), &limit_bytes.to_string())?;
        // Only present with swap accounting enabled.
        let memsw = memory.join("memory.memsw.limit_in_bytes");
        if memsw.exists() {
            write_knob(&memsw, &limit_bytes.to_string())?;
        }
        Ok(())
    }

    fn set_process_limit(&self, limit: u64) -> Result<()> {
        write_knob(&self.required("pids")?.join("pids.max"), &limit.to_string())
    }

    fn set_cpuset(&self, cpus: &str) -> Result<()> {
        write_knob(&self.required("cpuset")?.join("cpuset.cpus"), cpus)
    }

    fn attach(&self, pid: Pid) -> Result<()> {
        for (_, path) in &self.groups {
            write_knob(&path.join("cgroup.procs"), &pid.to_string())?;
        }
        Ok(())
    }

    fn usage(&self) -> Result<ResourceUsage> {
        let cpu_ns = match self.group("cpuacct") {
            Some(path) => read_counter(&path.join("cpuacct.usage"))?,
            None => None,
        };
        let memory_peak = match self.group("memory") {
            Some(path) => read_counter(&path.join("memory.max_usage_in_bytes"))?,
            None => None,
        };
        Ok(ResourceUsage {
            cpu_time: cpu_ns.map(Duration::from_nanos),
            memory_peak,
            // v1 keeps no peak process count
            process_peak: None,
        })
    }

    fn kill_all(&self) -> Result<()> {
        for (_, path) in &self.groups {
            for pid in read_pids(&path.join("cgroup.procs")) {
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if let Err(e) = self.kill_all() {
            log::warn!("Failed to kill remaining cgroup members: {}", e);
        }
        let mut errors = Vec::new();
        for (controller, path) in &self.groups {
            if let Err(e) = remove_group_dir(path) {
                errors.push(format!("{}: {}", controller, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Cgroup(format!(
                "Some cgroup cleanup operations failed: {}",
                errors.join("; ")
            )))
        }
    }
}
