//! The readiness prober.
//!
//! Polls a [`Check`] at a fixed interval until it succeeds, fails with a
//! non-retryable class, or the timeout elapses.
//!
//! Attempt *k* starts no earlier than `k * interval` after the start and only
//! while the deadline is in the future, and every attempt is cut off at the
//! deadline. A probe with timeout `T` and interval `I` therefore makes at
//! most `ceil(T / I)` attempts and never runs past `T`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checks::Check;
use crate::coordinates::Coordinates;
use crate::error::{CheckError, FailureClass};
use crate::report::as_millis;

/// Result of one polling iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure { class: FailureClass, message: String },
    Error { class: FailureClass, message: String },
}

/// One polling iteration, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub number: u32,
    pub at: DateTime<Utc>,
    /// Time since the phase started when the attempt finished.
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
}

/// Terminal state of a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The check succeeded.
    Ready,
    /// The check failed with a non-retryable class.
    Rejected(CheckError),
    /// The budget ran out; carries the last retryable failure, if any.
    TimedOut { last_failure: Option<CheckError> },
}

/// Boolean-with-reason result of a probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub verdict: ProbeVerdict,
    /// The most recent attempts (bounded by the prober's history size).
    pub attempts: Vec<Attempt>,
    /// Total attempts made.
    pub attempt_count: u32,
    pub elapsed: Duration,
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        self.verdict == ProbeVerdict::Ready
    }

    /// Human-readable reason for a non-ready outcome.
    pub fn reason(&self) -> String {
        match &self.verdict {
            ProbeVerdict::Ready => "ready".to_string(),
            ProbeVerdict::Rejected(err) => err.to_string(),
            ProbeVerdict::TimedOut {
                last_failure: Some(err),
            } => format!(
                "timed out after {} attempts; last failure {}",
                self.attempt_count, err
            ),
            ProbeVerdict::TimedOut { last_failure: None } => {
                format!("timed out after {} attempts", self.attempt_count)
            }
        }
    }
}

/// Polling primitive shared by all phases of a session.
#[derive(Debug, Clone)]
pub struct Prober {
    history: usize,
}

impl Prober {
    /// Create a prober that retains the last `history` attempts.
    pub fn new(history: usize) -> Self {
        Self { history }
    }

    /// Poll `check` against `target` until ready, rejected or timed out.
    pub async fn probe(
        &self,
        target: &Coordinates,
        check: &dyn Check,
        timeout: Duration,
        interval: Duration,
    ) -> ProbeOutcome {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = VecDeque::with_capacity(self.history.min(64));
        let mut attempt_count = 0u32;
        let mut last_failure = None;
        let what = check.describe();

        loop {
            let attempt_started = Instant::now();
            if attempt_started >= deadline {
                info!(
                    check = %what,
                    attempts = attempt_count,
                    last_class = last_failure.as_ref().map(|e: &CheckError| e.class.as_str()),
                    "Probe timed out"
                );
                return ProbeOutcome {
                    verdict: ProbeVerdict::TimedOut { last_failure },
                    attempts: attempts.into(),
                    attempt_count,
                    elapsed: started.elapsed(),
                };
            }

            attempt_count += 1;
            let result = match tokio::time::timeout_at(deadline, check.check(target)).await {
                Ok(result) => result,
                Err(_) => Err(CheckError::transient(format!(
                    "attempt still pending after the {}s budget",
                    timeout.as_secs()
                ))),
            };

            let outcome = match &result {
                Ok(()) => AttemptOutcome::Success,
                Err(err) if err.class.is_retryable() => AttemptOutcome::TransientFailure {
                    class: err.class,
                    message: err.message.clone(),
                },
                Err(err) => AttemptOutcome::Error {
                    class: err.class,
                    message: err.message.clone(),
                },
            };
            self.remember(
                &mut attempts,
                Attempt {
                    number: attempt_count,
                    at: Utc::now(),
                    elapsed: started.elapsed(),
                    outcome,
                },
            );

            match result {
                Ok(()) => {
                    debug!(check = %what, attempts = attempt_count, "Probe ready");
                    return ProbeOutcome {
                        verdict: ProbeVerdict::Ready,
                        attempts: attempts.into(),
                        attempt_count,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) if err.class.is_retryable() => {
                    debug!(
                        check = %what,
                        attempt = attempt_count,
                        class = %err.class,
                        error = %err.message,
                        "Not ready yet"
                    );
                    last_failure = Some(err);
                }
                Err(err) => {
                    warn!(
                        check = %what,
                        attempt = attempt_count,
                        class = %err.class,
                        error = %err.message,
                        "Probe rejected, not retrying"
                    );
                    return ProbeOutcome {
                        verdict: ProbeVerdict::Rejected(err),
                        attempts: attempts.into(),
                        attempt_count,
                        elapsed: started.elapsed(),
                    };
                }
            }

            // Sleeping to the deadline rather than returning early keeps the
            // reported elapsed time equal to the budget.
            let next = (attempt_started + interval).min(deadline);
            tokio::time::sleep_until(next).await;
        }
    }

    fn remember(&self, attempts: &mut VecDeque<Attempt>, attempt: Attempt) {
        if self.history == 0 {
            return;
        }
        if attempts.len() == self.history {
            attempts.pop_front();
        }
        attempts.push_back(attempt);
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new(10)
    }
}
