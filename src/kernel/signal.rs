//! Process-group termination and the external abort source.

use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct KillState {
    pid: Option<Pid>,
    triggered: bool,
}

/// Forcibly terminates a sandboxed process group on cancellation.
///
/// The runner arms the switch with the child pid as soon as the child
/// exists; the supervisor triggers it on deadline or abort. Triggering before
/// the child exists is remembered, and arming afterwards kills immediately,
/// so a cancellation can never be lost in the spawn window.
#[derive(Debug, Default)]
pub struct KillSwitch {
    state: Mutex<KillState>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the child. The child leads its own process group.
    ///
    /// Returns `false` if the switch was already triggered, in which case
    /// the group has just been killed.
    pub fn arm(&self, pid: Pid) -> bool {
        let mut state = self.lock();
        state.pid = Some(pid);
        if state.triggered {
            kill_group(pid);
            return false;
        }
        true
    }

    /// Forget the child once it has been reaped, so a late trigger cannot
    /// hit a recycled pid.
    pub fn disarm(&self) {
        self.lock().pid = None;
    }

    /// Kill the armed process group, or remember to kill it once armed.
    pub fn trigger(&self) {
        let mut state = self.lock();
        state.triggered = true;
        if let Some(pid) = state.pid {
            kill_group(pid);
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().triggered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KillState> {
        // A panicked holder leaves nothing half-updated: both fields are
        // written in single stores.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// SIGKILL the whole group led by `pid`, then `pid` itself in case it
/// has not reached `setsid` yet.
pub fn kill_group(pid: Pid) {
    match kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL) {
        Ok(()) => debug!("Sent SIGKILL to process group {}", pid),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process {}: {}", pid, e),
    }
}

/// Route SIGINT/SIGTERM/SIGHUP into a channel consumed by the supervisor.
///
/// The handler only sends on a bounded channel; repeated interrupts while a
/// message is pending are dropped.
pub fn install_abort_handler() -> Result<Receiver<()>, ctrlc::Error> {
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })?;
    info!("Abort handler installed (SIGINT, SIGTERM, SIGHUP)");
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    fn spawn_group_leader() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn sleep")
    }

    #[test]
    fn trigger_kills_armed_group() {
        let mut child = spawn_group_leader();
        let switch = KillSwitch::new();
        assert!(switch.arm(Pid::from_raw(child.id() as i32)));

        switch.trigger();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(switch.is_triggered());
    }

    #[test]
    fn trigger_before_arm_kills_on_arm() {
        let mut child = spawn_group_leader();
        let switch = KillSwitch::new();
        switch.trigger();

        assert!(!switch.arm(Pid::from_raw(child.id() as i32)));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn disarmed_switch_touches_nothing() {
        let mut child = spawn_group_leader();
        let switch = KillSwitch::new();
        switch.arm(Pid::from_raw(child.id() as i32));
        switch.disarm();
        switch.trigger();

        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
