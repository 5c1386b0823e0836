/// Core configuration types and the crate error taxonomy
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while preparing, running or measuring a sandboxed program.
///
/// Everything up to the exec handoff is a setup error; `ResourceRead` is the
/// only post-run variant. A nonzero exit or a signal from the sandboxed
/// program is never an error, it is recorded as a fact.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Syscall filter error: {0}")]
    Filter(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Resource usage read error: {0}")]
    ResourceRead(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// A host path exposed inside the sandbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPath {
    /// Absolute host path
    pub source: PathBuf,
    /// Destination relative to the sandbox root
    pub destination: PathBuf,
    /// Mount read-only
    #[serde(default = "default_true")]
    pub readonly: bool,
}

impl BindPath {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        readonly: bool,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            readonly,
        }
    }

    /// Parse `src:dst[:readonly]`. The bind is read-only unless the third
    /// field is literally `false`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let destination = parts.next().unwrap_or_default();
        if source.is_empty() || destination.is_empty() {
            return Err(SandboxError::Config(format!(
                "Invalid bind path '{}'. Use: src:dst[:readonly]",
                spec
            )));
        }
        let readonly = parts.next().map(|flag| flag != "false").unwrap_or(true);
        Ok(Self::new(source, destination, readonly))
    }
}

fn default_true() -> bool {
    true
}

/// Mutable run configuration, assembled from defaults, an optional JSON
/// file and command-line flags. Turned into an immutable
/// [`SandboxSpec`](crate::config::spec::SandboxSpec) before the run starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Program and arguments, resolved inside the sandbox
    pub argv: Vec<String>,
    /// Extra `KEY=VALUE` environment entries appended to the default PATH
    pub env: Vec<String>,
    /// Host directory bound read-write at `/work`
    pub workpath: Option<PathBuf>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Send unset stdout/stderr to /dev/null
    pub redirect_output_to_null: bool,
    /// CPU time limit (ms)
    pub time_limit_ms: u64,
    /// Wall clock limit (ms); raised to the time limit when smaller
    pub real_time_limit_ms: u64,
    /// Memory limit (KiB)
    pub memory_limit_kib: u64,
    /// Largest file the program may write (KiB)
    pub output_limit_kib: u64,
    pub open_file_limit: u64,
    /// Address space limit (KiB), 0 disables it
    pub vss_memory_limit_kib: u64,
    /// Stack limit (KiB); lowered to the memory limit when larger
    pub stack_limit_kib: u64,
    /// Maximum number of processes in the controller group
    pub proc_limit: u64,
    pub cpuset: Option<String>,
    pub bind_paths: Vec<BindPath>,
    pub mask_paths: Vec<PathBuf>,
    pub allow_syscalls: Vec<String>,
    pub kill_syscalls: Vec<String>,
    /// Allow process creation syscalls under the filter
    pub allow_proc: bool,
    /// Mount a read-only /proc
    pub mount_proc: bool,
    /// Mount a read-write /proc
    pub mount_proc_rw: bool,
    /// Enforce the syscall allow list; otherwise a pass-through filter is installed
    pub enable_seccomp: bool,
    /// Attach the diagnostic tracer
    pub trace: bool,
    pub network_namespace: bool,
    pub hostname: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            env: Vec::new(),
            workpath: None,
            stdin: None,
            stdout: None,
            stderr: None,
            redirect_output_to_null: false,
            time_limit_ms: 1000,
            real_time_limit_ms: 0,
            memory_limit_kib: 262_144,
            output_limit_kib: 262_144,
            open_file_limit: 256,
            vss_memory_limit_kib: 0,
            stack_limit_kib: 16_384,
            proc_limit: 1,
            cpuset: None,
            bind_paths: Vec::new(),
            mask_paths: Vec::new(),
            allow_syscalls: Vec::new(),
            kill_syscalls: Vec::new(),
            allow_proc: false,
            mount_proc: false,
            mount_proc_rw: false,
            enable_seccomp: false,
            trace: false,
            network_namespace: true,
            hostname: crate::config::defaults::DEFAULT_HOSTNAME.to_string(),
        }
    }
}

impl SandboxConfig {
    /// Load a configuration file (JSON). Missing keys take default values.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    pub fn limits(&self) -> Limits {
        Limits::new(
            self.time_limit_ms,
            self.real_time_limit_ms,
            self.memory_limit_kib,
            self.stack_limit_kib,
        )
    }
}

/// Effective limits after clamping.
///
/// The real-time limit is never below the time limit and the stack limit is
/// never above the memory limit, whatever the configured values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub time_limit: Duration,
    pub real_time_limit: Duration,
    pub memory_limit_bytes: u64,
    pub stack_limit_bytes: u64,
}

impl Limits {
    pub fn new(
        time_limit_ms: u64,
        real_time_limit_ms: u64,
        memory_limit_kib: u64,
        stack_limit_kib: u64,
    ) -> Self {
        let real_time_limit_ms = real_time_limit_ms.max(time_limit_ms);
        let stack_limit_kib = stack_limit_kib.min(memory_limit_kib);
        Self {
            time_limit: Duration::from_millis(time_limit_ms),
            real_time_limit: Duration::from_millis(real_time_limit_ms),
            memory_limit_bytes: memory_limit_kib.saturating_mul(1024),
            stack_limit_bytes: stack_limit_kib.saturating_mul(1024),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_time_limit_is_raised_to_time_limit() {
        let limits = Limits::new(1500, 0, 1024, 64);
        assert_eq!(limits.real_time_limit, Duration::from_millis(1500));

        let limits = Limits::new(1500, 4000, 1024, 64);
        assert_eq!(limits.real_time_limit, Duration::from_millis(4000));
    }

    #[test]
    fn stack_limit_is_lowered_to_memory_limit() {
        let limits = Limits::new(1000, 0, 4096, 16_384);
        assert_eq!(limits.stack_limit_bytes, 4096 * 1024);
        assert!(limits.stack_limit_bytes <= limits.memory_limit_bytes);
    }

    #[test]
    fn clamps_hold_across_inputs() {
        for time in [0u64, 1, 999, 1000, 65_000] {
            for real in [0u64, 1, 1000, 70_000] {
                for (mem, stack) in [(0u64, 0u64), (1, 2), (65_536, 16_384), (1024, 1 << 20)] {
                    let limits = Limits::new(time, real, mem, stack);
                    assert!(limits.real_time_limit >= limits.time_limit);
                    assert!(limits.stack_limit_bytes <= limits.memory_limit_bytes);
                }
            }
        }
    }

    #[test]
    fn bind_path_parse_defaults_to_readonly() {
        let bind = BindPath::parse("/opt/jdk:opt/jdk").unwrap();
        assert_eq!(bind, BindPath::new("/opt/jdk", "opt/jdk", true));

        let bind = BindPath::parse("/data:work/data:false").unwrap();
        assert!(!bind.readonly);

        let bind = BindPath::parse("/data:work/data:true").unwrap();
        assert!(bind.readonly);
    }

    #[test]
    fn bind_path_parse_rejects_missing_destination() {
        assert!(BindPath::parse("/only-source").is_err());
        assert!(BindPath::parse(":dst").is_err());
    }

    #[test]
    fn config_file_fills_missing_keys_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"time_limit_ms": 2500, "argv": ["/bin/true"]}"#).unwrap();

        let config = SandboxConfig::load_from_file(&path).unwrap();
        assert_eq!(config.time_limit_ms, 2500);
        assert_eq!(config.argv, vec!["/bin/true".to_string()]);
        assert_eq!(config.memory_limit_kib, 262_144);
        assert!(config.network_namespace);
    }
}
