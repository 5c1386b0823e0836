// Config validation
// Runs before any kernel object exists and fails fast with actionable errors.

use crate::config::types::{Result, SandboxConfig, SandboxError};
use crate::kernel::syscalls;
use std::path::Path;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a single configuration error when anything failed.
    pub fn into_result(self) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        Err(SandboxError::Config(format!(
            "Config validation failed:\n{}",
            self.errors.join("\n")
        )))
    }
}

/// Validate a configuration without touching the kernel.
pub fn validate_config(config: &SandboxConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_command(config, &mut result);
    validate_limits(config, &mut result);
    validate_paths(config, &mut result);
    validate_filter(config, &mut result);
    validate_identity(config, &mut result);

    result
}

fn validate_command(config: &SandboxConfig, result: &mut ValidationResult) {
    match config.argv.first() {
        None => result.add_error("argv cannot be empty".to_string()),
        Some(program) if program.is_empty() => {
            result.add_error("program path cannot be empty".to_string())
        }
        _ => {}
    }

    for arg in config.argv.iter().chain(config.env.iter()) {
        if arg.contains('\0') {
            result.add_error(format!("argument contains NUL byte: {:?}", arg));
        }
    }
    for entry in &config.env {
        if !entry.contains('=') {
            result.add_error(format!("env entry must be KEY=VALUE: {:?}", entry));
        }
    }
}

/// Validate resource limits
fn validate_limits(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.time_limit_ms == 0 {
        result.add_error("time_limit_ms cannot be zero".to_string());
    }

    if config.memory_limit_kib == 0 {
        result.add_error("memory_limit_kib cannot be zero".to_string());
    } else if config.memory_limit_kib < 1024 {
        result.add_warning(format!(
            "memory_limit_kib {} is very low (< 1MB), may cause MLE at startup",
            config.memory_limit_kib
        ));
    }

    if config.proc_limit == 0 {
        result.add_error("proc_limit cannot be zero".to_string());
    }

    if config.open_file_limit == 0 {
        result.add_error("open_file_limit cannot be zero".to_string());
    }

    if config.real_time_limit_ms != 0 && config.real_time_limit_ms < config.time_limit_ms {
        result.add_warning(format!(
            "real_time_limit_ms ({}) raised to time_limit_ms ({})",
            config.real_time_limit_ms, config.time_limit_ms
        ));
    }

    if config.stack_limit_kib > config.memory_limit_kib {
        result.add_warning(format!(
            "stack_limit_kib ({}) lowered to memory_limit_kib ({})",
            config.stack_limit_kib, config.memory_limit_kib
        ));
    }

    if let Some(cpus) = config.cpuset.as_deref() {
        if cpus.is_empty() || !cpus.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '-') {
            result.add_error(format!("cpuset must look like 0-3,5: {:?}", cpus));
        }
    }
}

/// Validate paths
fn validate_paths(config: &SandboxConfig, result: &mut ValidationResult) {
    if let Some(workpath) = &config.workpath {
        if !workpath.is_absolute() {
            result.add_error(format!("workpath must be absolute path: {:?}", workpath));
        } else if !workpath.is_dir() {
            result.add_error(format!("workpath is not a directory: {:?}", workpath));
        }
    }

    if let Some(stdin) = &config.stdin {
        if !stdin.is_file() {
            result.add_error(format!("stdin file does not exist: {:?}", stdin));
        }
    }

    for output in [&config.stdout, &config.stderr].into_iter().flatten() {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                result.add_error(format!(
                    "output file parent directory does not exist: {:?}",
                    parent
                ));
            }
        }
    }

    for bind in &config.bind_paths {
        if !bind.source.is_absolute() {
            result.add_error(format!("bind source must be absolute path: {:?}", bind.source));
        }
    }

    for mask in &config.mask_paths {
        if !mask.is_absolute() {
            result.add_error(format!("mask path must be absolute path: {:?}", mask));
        }
    }

    if config.mount_proc && config.mount_proc_rw {
        result.add_warning(
            "both mount_proc and mount_proc_rw set, /proc is read-write".to_string(),
        );
    }
}

fn validate_filter(config: &SandboxConfig, result: &mut ValidationResult) {
    for name in config.allow_syscalls.iter().chain(config.kill_syscalls.iter()) {
        if !syscalls::is_known(name) {
            result.add_error(format!("unknown syscall on this architecture: {}", name));
        }
    }

    if !config.enable_seccomp && !config.allow_syscalls.is_empty() {
        result.add_warning("allow_syscalls has no effect without enable_seccomp".to_string());
    }
}

fn validate_identity(config: &SandboxConfig, result: &mut ValidationResult) {
    let hostname = config.hostname.as_str();
    if hostname.is_empty() || hostname.len() > 64 || hostname.contains('\0') {
        result.add_error(format!("hostname must be 1-64 bytes without NUL: {:?}", hostname));
    }
}

/// Check if required controls are available on this system
pub fn check_system_capabilities() -> Vec<String> {
    let mut missing = Vec::new();

    if !Path::new("/sys/fs/cgroup").exists() {
        missing.push("cgroups not available".to_string());
    }
    if !Path::new("/proc/self/ns").exists() {
        missing.push("namespaces not available".to_string());
    }
    if !nix::unistd::geteuid().is_root() {
        missing.push("not running as root".to_string());
    }

    missing
}
