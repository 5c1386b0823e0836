//! Immutable run specification.
//!
//! Built once from a [`SandboxConfig`]; every artifact the runner consumes
//! (filter program, mount plan, POSIX limits, controller handle) is produced
//! here and never changes afterwards.

use crate::config::defaults;
use crate::config::types::{Limits, Result, SandboxConfig, SandboxError};
use crate::config::validator::validate_config;
use crate::kernel::cgroup::{ControllerHandle, ControllerLimits};
use crate::kernel::mount::{MountPlan, MountPlanBuilder};
use crate::kernel::namespace::{NamespaceSet, UtsIdentity};
use crate::kernel::rlimit::{PosixLimitInput, PosixLimits};
use crate::kernel::seccomp::{FilterBuilder, FilterProgram};
use crate::kernel::syscalls;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Files bound to descriptors 0, 1 and 2. Unset entries inherit the
/// parent's own descriptor.
#[derive(Debug, Default)]
pub struct StdioFiles {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl StdioFiles {
    pub fn new(stdin: Option<File>, stdout: Option<File>, stderr: Option<File>) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    fn open(config: &SandboxConfig) -> Result<Self> {
        let stdin = config.stdin.as_deref().map(open_input).transpose()?;
        let mut stdout = config.stdout.as_deref().map(open_output).transpose()?;
        let mut stderr = config.stderr.as_deref().map(open_output).transpose()?;

        if config.redirect_output_to_null {
            if stdout.is_none() {
                stdout = Some(open_output(Path::new("/dev/null"))?);
            }
            if stderr.is_none() {
                stderr = Some(open_output(Path::new("/dev/null"))?);
            }
        }
        Ok(Self::new(stdin, stdout, stderr))
    }

    /// Descriptors to install as 0, 1 and 2 in the child.
    pub fn raw_fds(&self) -> [RawFd; 3] {
        let fd = |file: &Option<File>, fallback: RawFd| {
            file.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(fallback)
        };
        [fd(&self.stdin, 0), fd(&self.stdout, 1), fd(&self.stderr, 2)]
    }
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        SandboxError::Config(format!("Failed to open stdin file {}: {}", path.display(), e))
    })
}

fn open_output(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| {
            SandboxError::Config(format!("Failed to open output file {}: {}", path.display(), e))
        })
}

/// Everything one supervised run needs. Fields are private and read-only.
#[derive(Debug)]
pub struct SandboxSpec {
    argv: Vec<String>,
    env: Vec<String>,
    work_dir: PathBuf,
    stdio: StdioFiles,
    limits: Limits,
    posix_limits: PosixLimits,
    filter: FilterProgram,
    mount_plan: MountPlan,
    mask_paths: Vec<PathBuf>,
    uts: UtsIdentity,
    namespaces: NamespaceSet,
    controller: ControllerHandle,
    controller_limits: ControllerLimits,
    trace: bool,
}

impl SandboxSpec {
    /// Validate `config` and compile it into a spec that owns `controller`.
    ///
    /// On failure the controller is dropped, which destroys its group.
    pub fn build(config: &SandboxConfig, controller: ControllerHandle) -> Result<Self> {
        let report = validate_config(config);
        for warning in &report.warnings {
            log::warn!("{}", warning);
        }
        report.into_result()?;

        let limits = config.limits();
        let filter = build_filter(config)?;
        let mount_plan = build_mount_plan(config)?;

        let mut mask_paths = defaults::default_mask_paths();
        mask_paths.extend(config.mask_paths.iter().cloned());

        let mut env = defaults::default_env();
        env.extend(config.env.iter().cloned());

        let posix_limits = PosixLimits::derive(&PosixLimitInput {
            time_limit: limits.time_limit,
            real_time_limit: limits.real_time_limit,
            memory_limit_bytes: limits.memory_limit_bytes,
            stack_limit_bytes: limits.stack_limit_bytes,
            output_limit_bytes: config.output_limit_kib.saturating_mul(1024),
            open_file_limit: config.open_file_limit,
            vss_limit_bytes: config.vss_memory_limit_kib.saturating_mul(1024),
        });

        let work_dir = if config.workpath.is_some() {
            PathBuf::from(defaults::WORK_DIR)
        } else {
            PathBuf::from("/")
        };

        let spec = Self {
            argv: config.argv.clone(),
            env,
            work_dir,
            stdio: StdioFiles::open(config)?,
            limits,
            posix_limits,
            filter,
            mount_plan,
            mask_paths,
            uts: UtsIdentity::new(&config.hostname, &config.hostname)?,
            namespaces: NamespaceSet::new(config.network_namespace),
            controller_limits: ControllerLimits {
                memory_bytes: limits.memory_limit_bytes,
                process_limit: config.proc_limit,
                cpuset: config.cpuset.clone(),
            },
            controller,
            trace: config.trace,
        };

        log::info!(
            "Sandbox spec built: argv={:?}, time={:?}, real_time={:?}, memory={} bytes, \
             mounts={}, filter={}",
            spec.argv,
            spec.limits.time_limit,
            spec.limits.real_time_limit,
            spec.limits.memory_limit_bytes,
            spec.mount_plan.entries().len(),
            spec.filter.mode()
        );
        Ok(spec)
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn stdio(&self) -> &StdioFiles {
        &self.stdio
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn posix_limits(&self) -> &PosixLimits {
        &self.posix_limits
    }

    pub fn filter(&self) -> &FilterProgram {
        &self.filter
    }

    pub fn mount_plan(&self) -> &MountPlan {
        &self.mount_plan
    }

    pub fn mask_paths(&self) -> &[PathBuf] {
        &self.mask_paths
    }

    pub fn uts(&self) -> &UtsIdentity {
        &self.uts
    }

    pub fn namespaces(&self) -> NamespaceSet {
        self.namespaces
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    pub fn controller_limits(&self) -> &ControllerLimits {
        &self.controller_limits
    }

    pub fn trace(&self) -> bool {
        self.trace
    }
}

fn build_filter(config: &SandboxConfig) -> Result<FilterProgram> {
    let builder = if config.enable_seccomp {
        let mut allow: Vec<String> = defaults::ALLOW_SYSCALLS
            .iter()
            .filter(|name| syscalls::is_known(name))
            .map(|name| name.to_string())
            .collect();
        if config.allow_proc {
            allow.extend(
                defaults::PROCESS_SYSCALLS
                    .iter()
                    .filter(|name| syscalls::is_known(name))
                    .map(|name| name.to_string()),
            );
        }
        allow.extend(config.allow_syscalls.iter().cloned());
        FilterBuilder::enforcing().allow(allow)
    } else {
        FilterBuilder::pass_through()
    };

    builder
        .kill(config.kill_syscalls.iter().cloned())
        .traced(config.trace)
        .build()
}

fn build_mount_plan(config: &SandboxConfig) -> Result<MountPlan> {
    let mut builder = MountPlanBuilder::new()
        .with_binds(defaults::READONLY_BINDS, true)
        .with_binds(defaults::READWRITE_BINDS, false);

    if let Some(workpath) = &config.workpath {
        builder = builder.with_bind(workpath, defaults::WORK_DIR, false);
    }
    builder = builder.with_tmpfs(defaults::TMPFS_DESTINATION, defaults::TMPFS_OPTIONS);

    for bind in &config.bind_paths {
        builder = builder.with_bind(&bind.source, &bind.destination, bind.readonly);
    }

    if config.mount_proc_rw {
        builder = builder.with_proc_rw();
    } else if config.mount_proc {
        builder = builder.with_proc();
    }

    Ok(builder.filter_not_exist().build()?)
}
