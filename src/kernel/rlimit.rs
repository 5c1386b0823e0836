//! POSIX resource limits applied inside the child.

use nix::sys::resource::{setrlimit, Resource};
use std::time::Duration;

/// A single `setrlimit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitEntry {
    pub name: &'static str,
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

impl RlimitEntry {
    fn fixed(name: &'static str, resource: Resource, value: u64) -> Self {
        Self {
            name,
            resource,
            soft: value,
            hard: value,
        }
    }
}

/// Inputs the POSIX limits derive from. Sizes are bytes.
#[derive(Debug, Clone, Copy)]
pub struct PosixLimitInput {
    pub time_limit: Duration,
    pub real_time_limit: Duration,
    pub memory_limit_bytes: u64,
    pub stack_limit_bytes: u64,
    pub output_limit_bytes: u64,
    pub open_file_limit: u64,
    pub vss_limit_bytes: u64,
}

/// Precomputed rlimit set, applied without allocating after fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixLimits {
    entries: Vec<RlimitEntry>,
}

impl PosixLimits {
    pub fn derive(input: &PosixLimitInput) -> Self {
        // Whole seconds plus one, so the kernel never beats the controller's
        // cpu accounting to the verdict.
        let cpu_soft = input.time_limit.as_secs() + 1;
        let cpu_hard = input.real_time_limit.as_secs().max(cpu_soft);

        let mut entries = vec![
            RlimitEntry {
                name: "RLIMIT_CPU",
                resource: Resource::RLIMIT_CPU,
                soft: cpu_soft,
                hard: cpu_hard,
            },
            RlimitEntry::fixed("RLIMIT_FSIZE", Resource::RLIMIT_FSIZE, input.output_limit_bytes),
            RlimitEntry::fixed("RLIMIT_STACK", Resource::RLIMIT_STACK, input.stack_limit_bytes),
            RlimitEntry::fixed("RLIMIT_DATA", Resource::RLIMIT_DATA, input.memory_limit_bytes),
            RlimitEntry::fixed("RLIMIT_NOFILE", Resource::RLIMIT_NOFILE, input.open_file_limit),
            RlimitEntry::fixed("RLIMIT_CORE", Resource::RLIMIT_CORE, 0),
        ];
        if input.vss_limit_bytes > 0 {
            entries.push(RlimitEntry::fixed(
                "RLIMIT_AS",
                Resource::RLIMIT_AS,
                input.vss_limit_bytes,
            ));
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[RlimitEntry] {
        &self.entries
    }

    pub fn get(&self, resource: Resource) -> Option<&RlimitEntry> {
        self.entries.iter().find(|e| e.resource == resource)
    }

    /// Apply every entry to the calling process. Stops at the first failure.
    pub fn apply(&self) -> nix::Result<()> {
        for entry in &self.entries {
            setrlimit(entry.resource, entry.soft as libc::rlim_t, entry.hard as libc::rlim_t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PosixLimitInput {
        PosixLimitInput {
            time_limit: Duration::from_millis(1000),
            real_time_limit: Duration::from_millis(1000),
            memory_limit_bytes: 256 << 20,
            stack_limit_bytes: 16 << 20,
            output_limit_bytes: 64 << 20,
            open_file_limit: 256,
            vss_limit_bytes: 0,
        }
    }

    #[test]
    fn cpu_soft_limit_rounds_up_a_second() {
        let limits = PosixLimits::derive(&PosixLimitInput {
            time_limit: Duration::from_millis(2500),
            real_time_limit: Duration::from_millis(2500),
            ..input()
        });
        let cpu = limits.get(Resource::RLIMIT_CPU).unwrap();
        assert_eq!(cpu.soft, 3);
        assert_eq!(cpu.hard, 3);
    }

    #[test]
    fn cpu_hard_limit_follows_real_time_limit() {
        let limits = PosixLimits::derive(&PosixLimitInput {
            real_time_limit: Duration::from_secs(10),
            ..input()
        });
        let cpu = limits.get(Resource::RLIMIT_CPU).unwrap();
        assert_eq!(cpu.soft, 2);
        assert_eq!(cpu.hard, 10);
    }

    #[test]
    fn address_space_limit_only_when_set() {
        assert!(PosixLimits::derive(&input()).get(Resource::RLIMIT_AS).is_none());

        let limits = PosixLimits::derive(&PosixLimitInput {
            vss_limit_bytes: 512 << 20,
            ..input()
        });
        assert_eq!(limits.get(Resource::RLIMIT_AS).unwrap().hard, 512 << 20);
    }

    #[test]
    fn core_dumps_disabled() {
        let limits = PosixLimits::derive(&input());
        assert_eq!(limits.get(Resource::RLIMIT_CORE).unwrap().hard, 0);
    }
}
