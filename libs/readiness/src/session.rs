//! Session state owned by the sequencer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use vmsmoke_id::SessionId;

use crate::coordinates::Coordinates;
use crate::phase::{Phase, Severity};
use crate::report::as_millis;

/// Status of one phase in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Warned,
    Failed,
    TimedOut,
    NotRun,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Passed => "passed",
            PhaseStatus::Warned => "warned",
            PhaseStatus::Failed => "failed",
            PhaseStatus::TimedOut => "timed_out",
            PhaseStatus::NotRun => "not_run",
        }
    }
}

/// Trace entry for one phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub name: String,
    pub kind: &'static str,
    pub severity: Severity,
    pub status: PhaseStatus,
    /// Offset from session start.
    #[serde(rename = "started_at_ms", serialize_with = "as_millis")]
    pub started_at: Duration,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub attempts: u32,
    /// Stable code for non-passing phases (`timed_out`, `deadline_exceeded`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PhaseRecord {
    /// Entry for a phase the run never reached.
    pub fn not_run(phase: &Phase) -> Self {
        Self {
            name: phase.name.clone(),
            kind: phase.action.kind(),
            severity: phase.severity,
            status: PhaseStatus::NotRun,
            started_at: Duration::ZERO,
            elapsed: Duration::ZERO,
            attempts: 0,
            reason_code: None,
            detail: None,
        }
    }
}

/// Stand-in deadline for budgets an `Instant` cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// One readiness run against one environment.
///
/// Coordinates are fixed at creation. The phase index only moves forward:
/// every phase is recorded once, in order.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    name: String,
    coordinates: Arc<Coordinates>,
    console_log: Option<PathBuf>,
    phases: Vec<Phase>,
    records: Vec<PhaseRecord>,
    index: usize,
    started: Instant,
    deadline: Instant,
    budget: Duration,
}

impl Session {
    /// Start a session; the deadline is `budget` from now.
    pub fn new(
        id: SessionId,
        name: impl Into<String>,
        coordinates: Arc<Coordinates>,
        phases: Vec<Phase>,
        budget: Duration,
    ) -> Self {
        let started = Instant::now();
        Self {
            id,
            name: name.into(),
            coordinates,
            console_log: None,
            records: Vec::with_capacity(phases.len()),
            phases,
            index: 0,
            started,
            deadline: started
                .checked_add(budget)
                .unwrap_or_else(|| started + FAR_FUTURE),
            budget,
        }
    }

    /// Attach the serial console log used for diagnostics.
    pub fn with_console_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.console_log = Some(path.into());
        self
    }

    /// Sum of phase timeouts plus slack.
    pub fn default_budget(phases: &[Phase], slack: Duration) -> Duration {
        phases
            .iter()
            .fold(slack, |total, p| total.saturating_add(p.timeout))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    pub fn console_log(&self) -> Option<&Path> {
        self.console_log.as_deref()
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<PhaseRecord> {
        self.records
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.phases.len()
    }

    /// Name of the last phase that passed.
    pub fn last_completed_phase(&self) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .find(|r| r.status == PhaseStatus::Passed)
            .map(|r| r.name.as_str())
    }

    pub(crate) fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.index)
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the session deadline.
    pub(crate) fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Record the current phase and move to the next one.
    pub(crate) fn complete_phase(&mut self, record: PhaseRecord) {
        debug_assert_eq!(
            self.phases.get(self.index).map(|p| p.name.as_str()),
            Some(record.name.as_str())
        );
        self.records.push(record);
        self.index += 1;
    }

    /// Record every phase after the current position as not run.
    pub(crate) fn skip_remaining(&mut self) {
        for phase in &self.phases[self.index.min(self.phases.len())..] {
            self.records.push(PhaseRecord::not_run(phase));
        }
        self.index = self.phases.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::CredentialRef;
    use crate::phase::PhaseAction;

    fn phases() -> Vec<Phase> {
        vec![
            Phase::new(
                "port-open",
                PhaseAction::Transport {
                    port: 22,
                    expect_banner: false,
                },
                Duration::from_secs(120),
            ),
            Phase::new("shell-ready", PhaseAction::ShellRoundtrip, Duration::from_secs(60)),
            Phase::new(
                "boot-finished",
                PhaseAction::FileExists {
                    path: "/var/lib/cloud/instance/boot-finished".to_string(),
                },
                Duration::from_secs(300),
            ),
        ]
    }

    fn session() -> Session {
        let coordinates = Arc::new(Coordinates {
            host: "127.0.0.1".to_string(),
            principal: "ubuntu".to_string(),
            credential: CredentialRef::Agent,
            forwards: vec![],
        });
        Session::new(
            SessionId::new(),
            "noble",
            coordinates,
            phases(),
            Duration::from_secs(600),
        )
    }

    fn passed(phase: &Phase) -> PhaseRecord {
        PhaseRecord {
            status: PhaseStatus::Passed,
            attempts: 1,
            ..PhaseRecord::not_run(phase)
        }
    }

    #[test]
    fn test_default_budget_adds_slack() {
        assert_eq!(
            Session::default_budget(&phases(), Duration::from_secs(60)),
            Duration::from_secs(540)
        );
    }

    #[test]
    fn test_unbounded_budget_saturates() {
        let mut phases = phases();
        phases[0].timeout = Duration::MAX;
        assert_eq!(
            Session::default_budget(&phases, Duration::from_secs(60)),
            Duration::MAX
        );

        let coordinates = Arc::new(Coordinates {
            host: "127.0.0.1".to_string(),
            principal: "ubuntu".to_string(),
            credential: CredentialRef::Agent,
            forwards: vec![],
        });
        let session = Session::new(SessionId::new(), "noble", coordinates, phases, Duration::MAX);
        assert!(session.remaining() > Duration::from_secs(365 * 24 * 60 * 60));
    }

    #[test]
    fn test_skip_remaining_after_failure() {
        let mut session = session();
        let first = passed(&session.phases()[0]);
        session.complete_phase(first);

        let failed = PhaseRecord {
            status: PhaseStatus::Failed,
            ..PhaseRecord::not_run(&session.phases()[1])
        };
        session.complete_phase(failed);
        session.skip_remaining();

        let statuses: Vec<_> = session.records().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![PhaseStatus::Passed, PhaseStatus::Failed, PhaseStatus::NotRun]
        );
        assert!(session.is_finished());
        assert_eq!(session.last_completed_phase(), Some("port-open"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let session = session();
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(session.remaining(), Duration::from_secs(500));
        assert_eq!(session.elapsed(), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(1000)).await;
        assert_eq!(session.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_record_json_uses_millis() {
        let record = PhaseRecord {
            started_at: Duration::from_millis(5_250),
            elapsed: Duration::from_secs(35),
            ..passed(&phases()[1])
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "passed");
        assert_eq!(json["kind"], "shell-roundtrip");
        assert_eq!(json["started_at_ms"], 5_250);
        assert_eq!(json["elapsed_ms"], 35_000);
        assert!(json.get("detail").is_none());
    }
}
