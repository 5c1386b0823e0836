//! Timeout supervisor.
//!
//! One run, one runner thread. The calling thread blocks in a single
//! `select!` over the runner's completion, the wall deadline and the
//! external abort channel. The wall deadline is armed at the exec handoff;
//! until then only the fixed setup watchdog applies. A deadline or abort kills the child's process
//! group and every member of its controller group; the runner thread then
//! observes the death and completes as usual, so facts are still collected.

use crate::config::defaults::{CGROUP_PARENT, SETUP_TIMEOUT};
use crate::config::spec::SandboxSpec;
use crate::config::types::{Result, SandboxConfig, SandboxError};
use crate::core::types::{ExecutionFacts, RawExit, RunControl};
use crate::exec::runner::{NamespaceRunner, Runner};
use crate::kernel::cgroup::backend::ControllerHandle;
use crate::kernel::signal::KillSwitch;
use crate::verdict::verdict::{Verdict, VerdictClassifier};
use crossbeam_channel::{after, at, bounded, never, select, Receiver};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ABORT_MESSAGE: &str = "aborted by external signal";

enum Event {
    Done(Result<RawExit>),
    /// Exec handoff; `None` once the runner dropped its sender
    Started(Option<Instant>),
    Deadline,
    /// `false` when the abort sender went away without firing
    Abort(bool),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cancellation {
    Deadline,
    Abort,
}

pub struct Supervisor<R: Runner> {
    runner: R,
    abort: Option<Receiver<()>>,
    setup_timeout: Duration,
}

impl<R: Runner> Supervisor<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            abort: None,
            setup_timeout: SETUP_TIMEOUT,
        }
    }

    /// Bound on spawn-to-handoff time, independent of the run's limits.
    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Cancel the run when a message arrives on `abort`.
    pub fn with_abort(mut self, abort: Receiver<()>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Run the program to completion and return its facts.
    ///
    /// Never fails: setup, wait and measurement errors are carried in
    /// [`ExecutionFacts::error`]. The controller group is destroyed before
    /// this returns.
    pub fn supervise(&self, spec: &SandboxSpec) -> ExecutionFacts {
        let real_time_limit = spec.limits().real_time_limit;
        let kill_switch = Arc::new(KillSwitch::new());
        let (started_tx, started_rx) = bounded(1);
        let (done_tx, done_rx) = bounded::<Result<RawExit>>(1);
        let control = RunControl::new(kill_switch, started_tx);

        let (outcome, cancellation) = thread::scope(|scope| {
            let runner_control = control.clone();
            let runner = &self.runner;
            let worker = scope.spawn(move || {
                let _ = done_tx.send(runner.run(spec, &runner_control));
            });

            let mut started = started_rx;
            let mut deadline = after(self.setup_timeout);
            let mut running = false;
            let mut abort = self.abort.clone().unwrap_or_else(never);
            let mut cancellation = None;

            let outcome = loop {
                let event = select! {
                    recv(done_rx) -> msg => Event::Done(msg.unwrap_or_else(|_| {
                        Err(SandboxError::Process(
                            "runner thread exited without a result".to_string(),
                        ))
                    })),
                    recv(started) -> msg => Event::Started(msg.ok()),
                    recv(deadline) -> _ => Event::Deadline,
                    recv(abort) -> msg => Event::Abort(msg.is_ok()),
                };

                match event {
                    Event::Done(outcome) => break outcome,
                    Event::Started(handoff) => {
                        if let Some(handoff) = handoff {
                            debug!("Program started; wall deadline in {:?}", real_time_limit);
                            deadline = at(handoff + real_time_limit);
                            running = true;
                        }
                        started = never();
                    }
                    Event::Deadline => {
                        deadline = never();
                        if cancellation.is_none() {
                            if running {
                                info!(
                                    "Real-time limit of {:?} reached, killing the run",
                                    real_time_limit
                                );
                            } else {
                                warn!("Setup exceeded {:?}, killing the run", self.setup_timeout);
                            }
                            cancellation = Some(Cancellation::Deadline);
                            cancel(spec, &control);
                        }
                    }
                    Event::Abort(received) => {
                        abort = never();
                        if received {
                            warn!("External abort received, killing the run");
                            cancellation = Some(Cancellation::Abort);
                            cancel(spec, &control);
                        }
                    }
                }
            };

            if worker.join().is_err() {
                warn!("Runner thread panicked");
            }
            (outcome, cancellation)
        });

        let mut facts = match outcome {
            Ok(raw) => measure(spec.controller(), raw),
            Err(e) => {
                warn!("Run failed: {}", e);
                ExecutionFacts::from_error(e.to_string())
            }
        };
        if cancellation == Some(Cancellation::Abort) {
            facts.error = Some(ABORT_MESSAGE.to_string());
        }

        if let Err(e) = spec.controller().destroy() {
            warn!("Failed to destroy controller group: {}", e);
        }
        facts
    }
}

fn cancel(spec: &SandboxSpec, control: &RunControl) {
    control.kill_switch().trigger();
    if let Err(e) = spec.controller().kill_all() {
        warn!("Failed to kill controller group members: {}", e);
    }
}

/// Merge controller counters into the runner's observations. Counters the
/// controller does not keep fall back to the direct child's rusage.
fn measure(controller: &ControllerHandle, raw: RawExit) -> ExecutionFacts {
    let usage = match controller.usage() {
        Ok(usage) => usage,
        Err(e) => {
            warn!("Failed to read resource usage: {}", e);
            return ExecutionFacts {
                exit_status: raw.exit_status,
                signal: raw.signal,
                setup_time: raw.setup_time,
                run_time: raw.run_time,
                ..ExecutionFacts::from_error(e.to_string())
            };
        }
    };

    ExecutionFacts {
        exit_status: raw.exit_status,
        signal: raw.signal,
        setup_time: raw.setup_time,
        run_time: raw.run_time,
        cpu_time: usage.cpu_time.unwrap_or(raw.rusage_cpu),
        memory_bytes: usage.memory_peak.unwrap_or(raw.rusage_max_rss),
        process_peak: usage.process_peak,
        error: None,
    }
}

/// Run `config` once in a fresh controller group and classify the outcome.
///
/// Every failure, from validation to resource accounting, folds into a
/// RunnerError verdict, so the caller always gets exactly one verdict.
pub fn execute(config: &SandboxConfig, abort: Option<Receiver<()>>) -> Verdict {
    let limits = config.limits();
    let spec = match prepare(config) {
        Ok(spec) => spec,
        Err(e) => {
            warn!("Sandbox setup failed: {}", e);
            return VerdictClassifier::classify(&ExecutionFacts::from_error(e.to_string()), &limits);
        }
    };

    let mut supervisor = Supervisor::new(NamespaceRunner::new());
    if let Some(abort) = abort {
        supervisor = supervisor.with_abort(abort);
    }
    let started = Instant::now();
    let facts = supervisor.supervise(&spec);
    debug!("Run finished in {:?}", started.elapsed());

    let verdict = VerdictClassifier::classify(&facts, spec.limits());
    info!("Verdict: {}", verdict.status);
    verdict
}

fn prepare(config: &SandboxConfig) -> Result<SandboxSpec> {
    let controller = ControllerHandle::create(CGROUP_PARENT)?;
    SandboxSpec::build(config, controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::cgroup::backend::{ResourceController, ResourceUsage};
    use nix::unistd::Pid;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    struct FixedUsage {
        usage: std::result::Result<ResourceUsage, String>,
        path: PathBuf,
    }

    impl ResourceController for FixedUsage {
        fn backend_name(&self) -> &str {
            "fixed"
        }
        fn path(&self) -> &Path {
            &self.path
        }
        fn set_memory_limit(&self, _: u64) -> Result<()> {
            Ok(())
        }
        fn set_process_limit(&self, _: u64) -> Result<()> {
            Ok(())
        }
        fn set_cpuset(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn attach(&self, _: Pid) -> Result<()> {
            Ok(())
        }
        fn usage(&self) -> Result<ResourceUsage> {
            self.usage.clone().map_err(SandboxError::ResourceRead)
        }
        fn kill_all(&self) -> Result<()> {
            Ok(())
        }
        fn destroy(&self) -> Result<()> {
            Ok(())
        }
    }

    fn controller(usage: std::result::Result<ResourceUsage, String>) -> ControllerHandle {
        ControllerHandle::new(Box::new(FixedUsage {
            usage,
            path: PathBuf::from("/fake"),
        }))
    }

    fn raw() -> RawExit {
        RawExit {
            rusage_cpu: Duration::from_millis(40),
            rusage_max_rss: 2048,
            run_time: Duration::from_millis(50),
            ..RawExit::exited(0)
        }
    }

    #[test]
    fn controller_counters_win_over_rusage() {
        let usage = ResourceUsage {
            cpu_time: Some(Duration::from_millis(45)),
            memory_peak: Some(1 << 20),
            process_peak: Some(3),
        };
        let facts = measure(&controller(Ok(usage)), raw());
        assert_eq!(facts.cpu_time, Duration::from_millis(45));
        assert_eq!(facts.memory_bytes, 1 << 20);
        assert_eq!(facts.process_peak, Some(3));
        assert!(!facts.is_error());
    }

    #[test]
    fn missing_counters_fall_back_to_rusage() {
        let facts = measure(&controller(Ok(ResourceUsage::default())), raw());
        assert_eq!(facts.cpu_time, Duration::from_millis(40));
        assert_eq!(facts.memory_bytes, 2048);
        assert_eq!(facts.process_peak, None);
        assert_eq!(facts.run_time, Duration::from_millis(50));
    }

    #[test]
    fn unreadable_counters_are_an_error() {
        let facts = measure(&controller(Err("memory.peak: EIO".to_string())), raw());
        assert!(facts.is_error());
        assert!(facts.error.unwrap().contains("memory.peak"));
    }

    #[test]
    fn cancel_triggers_kill_switch() {
        let (tx, _rx) = bounded(1);
        let control = RunControl::new(Arc::new(KillSwitch::new()), tx);
        let config = SandboxConfig {
            argv: vec!["/bin/true".to_string()],
            ..SandboxConfig::default()
        };
        let spec = SandboxSpec::build(&config, controller(Ok(ResourceUsage::default()))).unwrap();
        cancel(&spec, &control);
        assert!(control.is_cancelled());
        assert!(!spec.controller().is_destroyed());
    }
}
