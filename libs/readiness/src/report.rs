//! Session reports.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use vmsmoke_id::{EnvironmentId, SessionId};

use crate::diagnostics::Diagnostics;
use crate::lifecycle::TeardownStatus;
use crate::outcome::{Outcome, EXIT_FAILED, EXIT_PASSED, EXIT_TIMED_OUT};
use crate::session::PhaseRecord;

pub(crate) fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Everything known about one finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub target: String,
    /// Absent when provisioning failed.
    pub environment_id: Option<EnvironmentId>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub outcome: Outcome,
    pub reason_code: &'static str,
    pub last_completed_phase: Option<String>,
    pub phases: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
    /// Absent when nothing was acquired.
    pub teardown: Option<TeardownStatus>,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Exit status for a batch of sessions.
///
/// Any failure wins over timeouts; timeouts win over passes.
pub fn aggregate_exit_code(reports: &[SessionReport]) -> i32 {
    let codes = reports.iter().map(SessionReport::exit_code);
    codes.fold(EXIT_PASSED, |acc, code| match (acc, code) {
        (EXIT_FAILED, _) | (_, EXIT_FAILED) => EXIT_FAILED,
        (EXIT_TIMED_OUT, _) | (_, EXIT_TIMED_OUT) => EXIT_TIMED_OUT,
        _ => EXIT_PASSED,
    })
}

/// A batch of reports as written by `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub exit_code: i32,
    pub sessions: Vec<SessionReport>,
}

impl RunSummary {
    pub fn new(sessions: Vec<SessionReport>) -> Self {
        let count = |code| sessions.iter().filter(|r| r.exit_code() == code).count();
        Self {
            passed: count(EXIT_PASSED),
            failed: count(EXIT_FAILED),
            timed_out: count(EXIT_TIMED_OUT),
            exit_code: aggregate_exit_code(&sessions),
            sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{FailureReason, TimeoutCause};

    fn report(outcome: Outcome) -> SessionReport {
        SessionReport {
            session_id: SessionId::new(),
            target: "noble".to_string(),
            environment_id: Some(EnvironmentId::new()),
            started_at: Utc::now(),
            elapsed: Duration::from_millis(1500),
            reason_code: outcome.reason_code(),
            outcome,
            last_completed_phase: None,
            phases: vec![],
            warnings: vec![],
            diagnostics: None,
            teardown: Some(TeardownStatus::Released),
        }
    }

    fn failed() -> Outcome {
        Outcome::Failed {
            phase: "deploy".to_string(),
            reason: FailureReason::Aborted,
        }
    }

    fn timed_out() -> Outcome {
        Outcome::TimedOut {
            phase: "port-open".to_string(),
            budget: Duration::from_secs(120),
            cause: TimeoutCause::PhaseTimeout,
            last_failure: None,
        }
    }

    #[test]
    fn test_aggregate_exit_code_precedence() {
        assert_eq!(aggregate_exit_code(&[]), 0);
        assert_eq!(aggregate_exit_code(&[report(Outcome::Passed)]), 0);
        assert_eq!(
            aggregate_exit_code(&[report(Outcome::Passed), report(timed_out())]),
            2
        );
        assert_eq!(
            aggregate_exit_code(&[report(timed_out()), report(failed()), report(Outcome::Passed)]),
            1
        );
    }

    #[test]
    fn test_summary_counts() {
        let summary = RunSummary::new(vec![
            report(Outcome::Passed),
            report(timed_out()),
            report(timed_out()),
        ]);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.timed_out, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.exit_code, 2);
    }

    #[test]
    fn test_report_json_fields() {
        let json = serde_json::to_value(report(Outcome::Passed)).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["reason_code"], "passed");
        assert_eq!(json["outcome"]["verdict"], "passed");
        assert_eq!(json["teardown"]["status"], "released");
        assert!(json["session_id"].as_str().unwrap().starts_with("ses_"));
        assert!(json.get("diagnostics").is_none());
    }
}
