//! Traced runs.
//!
//! The tracer waits on any child of the process, so this file holds a single
//! test and runs in its own test binary.

use runbox::config::defaults::CGROUP_PARENT;
use runbox::kernel::cgroup::backend::ControllerHandle;
use runbox::{execute, SandboxConfig, VerdictStatus};

#[cfg(target_arch = "x86_64")]
#[test]
fn traced_forbidden_syscall_is_signalled_not_runner_error() {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    if let Err(e) = ControllerHandle::create(CGROUP_PARENT).and_then(|h| h.destroy()) {
        eprintln!("skipping: cgroups unavailable: {}", e);
        return;
    }

    let work = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        argv: vec!["/bin/mkdir".to_string(), "/work/traced".to_string()],
        workpath: Some(work.path().to_path_buf()),
        kill_syscalls: vec!["mkdir".to_string(), "mkdirat".to_string()],
        trace: true,
        ..SandboxConfig::default()
    };

    let verdict = execute(&config, None);
    assert_eq!(verdict.status, VerdictStatus::Signalled, "{:?}", verdict.facts);
    assert_eq!(verdict.facts.signal, Some(libc::SIGKILL));
    assert!(!work.path().join("traced").exists());
}
