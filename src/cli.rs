use crate::config::types::{BindPath, Result as SandboxResult, SandboxConfig, SandboxError};
use crate::config::validator::check_system_capabilities;
use crate::core::supervisor::execute;
use crate::core::types::ExecutionFacts;
use crate::kernel::signal::install_abort_handler;
use crate::verdict::{Verdict, VerdictClassifier};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Run one program in a fresh sandbox and print its result record as JSON.
#[derive(Parser, Debug)]
#[command(name = "runbox", author, version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file; flags given on the command line override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Host directory bound read-write at /work and used as the working directory
    #[arg(long, value_name = "DIR")]
    workpath: Option<PathBuf>,

    /// CPU time limit in milliseconds
    #[arg(long = "time-limit", value_name = "MS")]
    time_limit: Option<u64>,

    /// Wall clock limit in milliseconds (never below the time limit)
    #[arg(long = "realtime-limit", value_name = "MS")]
    realtime_limit: Option<u64>,

    /// Memory limit in KiB
    #[arg(long = "memory-limit", value_name = "KIB")]
    memory_limit: Option<u64>,

    /// Largest file the program may write, in KiB
    #[arg(long = "output-limit", value_name = "KIB")]
    output_limit: Option<u64>,

    #[arg(long = "open-file-limit", value_name = "N")]
    open_file_limit: Option<u64>,

    /// Address space limit in KiB (0 disables it)
    #[arg(long = "vss-memory-limit", value_name = "KIB")]
    vss_memory_limit: Option<u64>,

    /// Stack limit in KiB (never above the memory limit)
    #[arg(long = "stack-limit", value_name = "KIB")]
    stack_limit: Option<u64>,

    /// Maximum number of processes
    #[arg(long = "proc-limit", value_name = "N")]
    proc_limit: Option<u64>,

    /// CPUs the program may run on, e.g. 0-1,3
    #[arg(long)]
    cpuset: Option<String>,

    #[arg(long, value_name = "FILE")]
    stdin: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    stdout: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    stderr: Option<PathBuf>,

    /// Send unset stdout/stderr to /dev/null
    #[arg(long = "redir-output-to-null")]
    redirect_output_to_null: bool,

    /// Extra bind mount (read-only unless the third field is `false`)
    #[arg(
        long = "add-bind-path",
        value_name = "SRC:DST[:READONLY]",
        value_parser = parse_bind_path
    )]
    bind_paths: Vec<BindPath>,

    /// Path made empty inside the sandbox
    #[arg(long = "add-mask-path", value_name = "PATH")]
    mask_paths: Vec<PathBuf>,

    /// Syscall added to the allow list
    #[arg(long = "add-allow-syscall", value_name = "NAME")]
    allow_syscalls: Vec<String>,

    /// Syscall that kills the program
    #[arg(long = "add-kill-syscall", value_name = "NAME")]
    kill_syscalls: Vec<String>,

    /// Environment entry appended to the default environment
    #[arg(long = "add-env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Allow process creation under the syscall filter
    #[arg(long = "allow-proc")]
    allow_proc: bool,

    /// Mount a read-only /proc
    #[arg(long = "allow-mount-proc")]
    mount_proc: bool,

    /// Mount a read-write /proc
    #[arg(long = "allow-mount-proc-rw")]
    mount_proc_rw: bool,

    /// Enforce the syscall allow list
    #[arg(long)]
    seccomp: bool,

    /// Trace the program and log forbidden syscalls by name
    #[arg(long = "show-trace-details")]
    trace: bool,

    /// Share the host network namespace
    #[arg(long = "no-network-namespace")]
    no_network_namespace: bool,

    /// Program and its arguments
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PROGRAM"
    )]
    command: Vec<String>,
}

fn parse_bind_path(value: &str) -> std::result::Result<BindPath, String> {
    BindPath::parse(value).map_err(|e| e.to_string())
}

impl Cli {
    /// Merge the optional configuration file with the command line.
    pub fn into_config(self) -> SandboxResult<SandboxConfig> {
        let mut config = match &self.config {
            Some(path) => SandboxConfig::load_from_file(path)?,
            None => SandboxConfig::default(),
        };

        config.argv = self.command;
        config.env.extend(self.env);
        if let Some(workpath) = self.workpath {
            config.workpath = Some(workpath);
        }
        if config.workpath.is_none() {
            return Err(SandboxError::Config("--workpath is required".to_string()));
        }

        override_with(&mut config.time_limit_ms, self.time_limit);
        override_with(&mut config.real_time_limit_ms, self.realtime_limit);
        override_with(&mut config.memory_limit_kib, self.memory_limit);
        override_with(&mut config.output_limit_kib, self.output_limit);
        override_with(&mut config.open_file_limit, self.open_file_limit);
        override_with(&mut config.vss_memory_limit_kib, self.vss_memory_limit);
        override_with(&mut config.stack_limit_kib, self.stack_limit);
        override_with(&mut config.proc_limit, self.proc_limit);

        if self.cpuset.is_some() {
            config.cpuset = self.cpuset;
        }
        if self.stdin.is_some() {
            config.stdin = self.stdin;
        }
        if self.stdout.is_some() {
            config.stdout = self.stdout;
        }
        if self.stderr.is_some() {
            config.stderr = self.stderr;
        }

        config.bind_paths.extend(self.bind_paths);
        config.mask_paths.extend(self.mask_paths);
        config.allow_syscalls.extend(self.allow_syscalls);
        config.kill_syscalls.extend(self.kill_syscalls);

        config.redirect_output_to_null |= self.redirect_output_to_null;
        config.allow_proc |= self.allow_proc;
        config.mount_proc |= self.mount_proc;
        config.mount_proc_rw |= self.mount_proc_rw;
        config.enable_seccomp |= self.seccomp;
        config.trace |= self.trace;
        if self.no_network_namespace {
            config.network_namespace = false;
        }

        Ok(config)
    }
}

fn override_with(field: &mut u64, value: Option<u64>) {
    if let Some(value) = value {
        *field = value;
    }
}

/// Entry point of the `runbox` binary. Prints exactly one record on stdout.
pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    for missing in check_system_capabilities() {
        log::warn!("Host check: {}", missing);
    }

    let verdict = match cli.into_config() {
        Ok(config) => {
            let abort = match install_abort_handler() {
                Ok(abort) => Some(abort),
                Err(e) => {
                    log::warn!("Failed to install abort handler: {}", e);
                    None
                }
            };
            execute(&config, abort)
        }
        Err(e) => {
            log::error!("{}", e);
            let limits = SandboxConfig::default().limits();
            VerdictClassifier::classify(&ExecutionFacts::from_error(e.to_string()), &limits)
        }
    };

    emit_record(&verdict)
}

fn emit_record(verdict: &Verdict) -> Result<()> {
    println!("{}", serde_json::to_string(&verdict.record())?);
    Ok(())
}
