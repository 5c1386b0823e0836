/// Verdict classification and the result record
///
/// The verdict is a pure function of the execution facts and the configured
/// limits; nothing is carried between runs.
use crate::config::types::Limits;
use crate::core::types::ExecutionFacts;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final classification of a run. Codes match the record's `status` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictStatus {
    Normal,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    Signalled,
    RunnerError,
}

impl VerdictStatus {
    pub fn code(self) -> u8 {
        match self {
            VerdictStatus::Normal => 1,
            VerdictStatus::TimeLimitExceeded => 2,
            VerdictStatus::MemoryLimitExceeded => 3,
            VerdictStatus::Signalled => 6,
            VerdictStatus::RunnerError => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        [
            VerdictStatus::Normal,
            VerdictStatus::TimeLimitExceeded,
            VerdictStatus::MemoryLimitExceeded,
            VerdictStatus::Signalled,
            VerdictStatus::RunnerError,
        ]
        .into_iter()
        .find(|status| status.code() == code)
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerdictStatus::Normal => "Normal",
            VerdictStatus::TimeLimitExceeded => "Time Limit Exceeded",
            VerdictStatus::MemoryLimitExceeded => "Memory Limit Exceeded",
            VerdictStatus::Signalled => "Signalled",
            VerdictStatus::RunnerError => "Runner Error",
        };
        f.write_str(name)
    }
}

/// A status paired with the facts it was derived from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub facts: ExecutionFacts,
}

impl Verdict {
    pub fn record(&self) -> ResultRecord {
        ResultRecord::from(self)
    }
}

/// Verdict classifier - pure function over execution facts
pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify in fixed order:
    ///
    /// 1. an internal error is a runner error
    /// 2. cpu time at or over the limit is TLE
    /// 3. peak memory at or over the limit turns a Normal candidate into MLE
    /// 4. a nonzero exit after the wall deadline is TLE
    /// 5. a nonzero exit under both time limits is Signalled
    pub fn classify(facts: &ExecutionFacts, limits: &Limits) -> Verdict {
        Verdict {
            status: Self::status(facts, limits),
            facts: facts.clone(),
        }
    }

    fn status(facts: &ExecutionFacts, limits: &Limits) -> VerdictStatus {
        if facts.error.is_some() {
            return VerdictStatus::RunnerError;
        }

        let mut status = if facts.cpu_time >= limits.time_limit {
            VerdictStatus::TimeLimitExceeded
        } else {
            VerdictStatus::Normal
        };

        if status == VerdictStatus::Normal && facts.memory_bytes >= limits.memory_limit_bytes {
            status = VerdictStatus::MemoryLimitExceeded;
        }

        if status == VerdictStatus::Normal && facts.exit_status != 0 {
            if facts.run_time > limits.real_time_limit {
                status = VerdictStatus::TimeLimitExceeded;
            } else if facts.cpu_time < limits.time_limit
                && facts.run_time < limits.real_time_limit
            {
                // Best effort: a deadline kill racing a natural nonzero exit
                // must not read as a clean run.
                status = VerdictStatus::Signalled;
            }
        }

        status
    }
}

/// The single record printed per run. Times are nanoseconds, memory bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub status: u8,
    pub exit_status: i32,
    pub error: String,
    pub time: u64,
    pub run_time: u64,
    pub memory: u64,
    pub proc_peak: Option<u64>,
}

impl From<&Verdict> for ResultRecord {
    fn from(verdict: &Verdict) -> Self {
        let facts = &verdict.facts;
        Self {
            status: verdict.status.code(),
            exit_status: facts.exit_status,
            error: facts.error.clone().unwrap_or_default(),
            time: saturating_nanos(facts.cpu_time),
            run_time: saturating_nanos(facts.run_time),
            memory: facts.memory_bytes,
            proc_peak: facts.process_peak,
        }
    }
}

fn saturating_nanos(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> Limits {
        Limits::new(1000, 2000, 65_536, 8192)
    }

    fn facts(exit_status: i32, cpu_ms: u64, run_ms: u64, memory: u64) -> ExecutionFacts {
        ExecutionFacts {
            exit_status,
            cpu_time: Duration::from_millis(cpu_ms),
            run_time: Duration::from_millis(run_ms),
            memory_bytes: memory,
            ..ExecutionFacts::default()
        }
    }

    fn status_of(facts: &ExecutionFacts) -> VerdictStatus {
        VerdictClassifier::classify(facts, &limits()).status
    }

    #[test]
    fn test_classify_normal() {
        assert_eq!(status_of(&facts(0, 10, 20, 1 << 20)), VerdictStatus::Normal);
    }

    #[test]
    fn test_error_wins_over_everything() {
        let mut f = facts(9, 5000, 5000, 1 << 30);
        f.error = Some("mount failed".to_string());
        let verdict = VerdictClassifier::classify(&f, &limits());
        assert_eq!(verdict.status, VerdictStatus::RunnerError);
        assert_eq!(verdict.record().error, "mount failed");
    }

    #[test]
    fn test_cpu_at_limit_is_tle() {
        assert_eq!(status_of(&facts(0, 1000, 1100, 0)), VerdictStatus::TimeLimitExceeded);
        assert_eq!(status_of(&facts(9, 1500, 1600, 0)), VerdictStatus::TimeLimitExceeded);
    }

    #[test]
    fn test_tle_takes_precedence_over_mle() {
        let f = facts(9, 1200, 1300, 64 << 20);
        assert_eq!(status_of(&f), VerdictStatus::TimeLimitExceeded);
    }

    #[test]
    fn test_memory_at_limit_is_mle() {
        let memory = limits().memory_limit_bytes;
        assert_eq!(status_of(&facts(0, 10, 20, memory)), VerdictStatus::MemoryLimitExceeded);
        assert_eq!(status_of(&facts(9, 10, 20, memory + 1)), VerdictStatus::MemoryLimitExceeded);
    }

    #[test]
    fn test_nonzero_exit_after_deadline_is_tle() {
        // SIGKILL from the deadline: little cpu, wall time past the limit
        assert_eq!(status_of(&facts(9, 50, 2001, 0)), VerdictStatus::TimeLimitExceeded);
    }

    #[test]
    fn test_nonzero_exit_within_limits_is_signalled() {
        assert_eq!(status_of(&facts(1, 10, 20, 0)), VerdictStatus::Signalled);
        assert_eq!(status_of(&facts(11, 999, 1999, 0)), VerdictStatus::Signalled);
    }

    #[test]
    fn test_nonzero_exit_exactly_at_wall_limit_stays_normal() {
        // Neither strictly over nor strictly under the real-time limit.
        assert_eq!(status_of(&facts(1, 10, 2000, 0)), VerdictStatus::Normal);
    }

    #[test]
    fn test_cpu_over_limit_is_never_normal() {
        for exit in [0, 1, 9] {
            for cpu in [1000u64, 1001, 10_000] {
                for run in [0u64, 1000, 5000] {
                    for memory in [0u64, 64 << 20, 1 << 30] {
                        let status = status_of(&facts(exit, cpu, run, memory));
                        assert_eq!(status, VerdictStatus::TimeLimitExceeded);
                    }
                }
            }
        }
    }

    #[test]
    fn test_memory_over_limit_is_mle_or_tle() {
        let limit = limits().memory_limit_bytes;
        for exit in [0, 1, 9] {
            for cpu in [0u64, 999, 1000] {
                for run in [0u64, 2000, 3000] {
                    let status = status_of(&facts(exit, cpu, run, limit + 4096));
                    assert!(matches!(
                        status,
                        VerdictStatus::MemoryLimitExceeded | VerdictStatus::TimeLimitExceeded
                    ));
                }
            }
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(VerdictStatus::Normal.code(), 1);
        assert_eq!(VerdictStatus::TimeLimitExceeded.code(), 2);
        assert_eq!(VerdictStatus::MemoryLimitExceeded.code(), 3);
        assert_eq!(VerdictStatus::Signalled.code(), 6);
        assert_eq!(VerdictStatus::RunnerError.code(), 8);
        assert_eq!(VerdictStatus::from_code(6), Some(VerdictStatus::Signalled));
        assert_eq!(VerdictStatus::from_code(4), None);
    }

    #[test]
    fn test_record_field_names_and_units() {
        let mut f = facts(0, 250, 300, 4096);
        f.process_peak = Some(2);
        let record = VerdictClassifier::classify(&f, &limits()).record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], 1);
        assert_eq!(json["exitStatus"], 0);
        assert_eq!(json["error"], "");
        assert_eq!(json["time"], 250_000_000u64);
        assert_eq!(json["runTime"], 300_000_000u64);
        assert_eq!(json["memory"], 4096);
        assert_eq!(json["procPeak"], 2);
    }
}
