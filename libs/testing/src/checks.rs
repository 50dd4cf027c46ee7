use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use vmsmoke_readiness::{Check, CheckError, CheckFactory, Coordinates, FailureClass, Phase};

/// Readiness timeline of one phase.
#[derive(Debug, Clone)]
pub enum Script {
    /// Refuses until the offset, then succeeds.
    ReadyAt(Duration),
    /// Authentication fails until the offset, then succeeds.
    AuthUntil(Duration),
    /// Refuses forever.
    Never,
    /// Fails with a non-retryable error on the first attempt.
    Reject(String),
}

/// Check factory driven by per-phase scripts.
///
/// Phases without a script are ready immediately. Command phases are left
/// to the executor.
pub struct ScriptedChecks {
    epoch: Instant,
    scripts: HashMap<String, Script>,
    latency: Duration,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl ScriptedChecks {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            scripts: HashMap::new(),
            latency: Duration::ZERO,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn script(mut self, phase: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(phase.into(), script);
        self
    }

    pub fn ready_at(self, phase: impl Into<String>, at: Duration) -> Self {
        self.script(phase, Script::ReadyAt(at))
    }

    pub fn never(self, phase: impl Into<String>) -> Self {
        self.script(phase, Script::Never)
    }

    pub fn reject(self, phase: impl Into<String>, message: impl Into<String>) -> Self {
        self.script(phase, Script::Reject(message.into()))
    }

    /// Delay every attempt by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Attempts made so far for `phase`.
    pub fn attempts(&self, phase: &str) -> u32 {
        self.attempts
            .lock()
            .map(|a| a.get(phase).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Default for ScriptedChecks {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckFactory for ScriptedChecks {
    fn build(&self, phase: &Phase) -> Option<Box<dyn Check>> {
        if phase.action.is_one_shot() {
            return None;
        }
        Some(Box::new(ScriptedCheck {
            phase: phase.name.clone(),
            epoch: self.epoch,
            script: self
                .scripts
                .get(&phase.name)
                .cloned()
                .unwrap_or(Script::ReadyAt(Duration::ZERO)),
            latency: self.latency,
            attempts: Arc::clone(&self.attempts),
        }))
    }
}

struct ScriptedCheck {
    phase: String,
    epoch: Instant,
    script: Script,
    latency: Duration,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl Check for ScriptedCheck {
    fn describe(&self) -> String {
        format!("scripted {}", self.phase)
    }

    async fn check(&self, _target: &Coordinates) -> Result<(), CheckError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry(self.phase.clone()).or_default() += 1;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let now = self.epoch.elapsed();
        match &self.script {
            Script::ReadyAt(at) if now >= *at => Ok(()),
            Script::ReadyAt(_) | Script::Never => {
                Err(CheckError::transient("Connection refused"))
            }
            Script::AuthUntil(at) if now >= *at => Ok(()),
            Script::AuthUntil(_) => Err(CheckError::new(
                FailureClass::AuthenticationNotYetAvailable,
                "Permission denied (publickey)",
            )),
            Script::Reject(message) => Err(CheckError::configuration(message.clone())),
        }
    }
}
