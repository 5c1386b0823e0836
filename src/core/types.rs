use crate::kernel::signal::KillSwitch;
use crossbeam_channel::Sender;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the runner observed about one child, before controller counters
/// are merged in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawExit {
    /// Exit code, or the signal number for a signal death
    pub exit_status: i32,
    pub signal: Option<i32>,
    /// Spawn to exec handoff
    pub setup_time: Duration,
    /// Exec handoff to termination
    pub run_time: Duration,
    /// `wait4` user + system time of the direct child
    pub rusage_cpu: Duration,
    /// `wait4` peak resident set of the direct child, bytes
    pub rusage_max_rss: u64,
}

impl RawExit {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_status: code,
            signal: None,
            setup_time: Duration::ZERO,
            run_time: Duration::ZERO,
            rusage_cpu: Duration::ZERO,
            rusage_max_rss: 0,
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            exit_status: signal,
            signal: Some(signal),
            ..Self::exited(0)
        }
    }
}

/// Shared between the supervisor and the runner thread of one run.
///
/// The runner arms the kill switch with the child pid and reports the exec
/// handoff; the supervisor triggers the switch on cancellation and moves its
/// deadline to `handoff + real-time limit`.
#[derive(Debug, Clone)]
pub struct RunControl {
    kill_switch: Arc<KillSwitch>,
    started: Sender<Instant>,
}

impl RunControl {
    pub fn new(kill_switch: Arc<KillSwitch>, started: Sender<Instant>) -> Self {
        Self {
            kill_switch,
            started,
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// See [`KillSwitch::arm`].
    pub fn arm(&self, pid: Pid) -> bool {
        self.kill_switch.arm(pid)
    }

    pub fn disarm(&self) {
        self.kill_switch.disarm();
    }

    pub fn is_cancelled(&self) -> bool {
        self.kill_switch.is_triggered()
    }

    /// Report the exec handoff. Only the first report counts.
    pub fn mark_started(&self, at: Instant) {
        let _ = self.started.try_send(at);
    }
}

/// Facts of one run, produced exactly once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFacts {
    pub exit_status: i32,
    pub signal: Option<i32>,
    pub setup_time: Duration,
    pub run_time: Duration,
    pub cpu_time: Duration,
    pub memory_bytes: u64,
    /// Absent when the controller keeps no peak process count
    pub process_peak: Option<u64>,
    /// Setup or measurement failure; forces RunnerError
    pub error: Option<String>,
}

impl ExecutionFacts {
    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn signalled_exit_reports_signal_number_as_status() {
        let exit = RawExit::signalled(9);
        assert_eq!(exit.exit_status, 9);
        assert_eq!(exit.signal, Some(9));
        assert_eq!(RawExit::exited(3).signal, None);
    }

    #[test]
    fn only_first_start_is_reported() {
        let (tx, rx) = bounded(1);
        let control = RunControl::new(Arc::new(KillSwitch::new()), tx);
        let first = Instant::now();
        control.mark_started(first);
        control.mark_started(first + Duration::from_secs(1));
        assert_eq!(rx.try_recv().unwrap(), first);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn error_facts_carry_message() {
        let facts = ExecutionFacts::from_error("mount failed");
        assert!(facts.is_error());
        assert_eq!(facts.error.as_deref(), Some("mount failed"));
        assert_eq!(facts.exit_status, 0);
    }
}
