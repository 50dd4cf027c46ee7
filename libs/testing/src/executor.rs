use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use vmsmoke_readiness::{CommandOutput, Coordinates, ExecError, RemoteExecutor};

/// What a scripted command does.
#[derive(Debug, Clone)]
pub enum Reply {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    Error(ExecError),
    /// Never answers; the call ends with a timeout after its budget.
    Hang,
}

impl Reply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn exit_with(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Reply::Exit {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn refused() -> Self {
        Reply::Error(ExecError::Unreachable("Connection refused".to_string()))
    }

    pub fn denied() -> Self {
        Reply::Error(ExecError::AuthenticationFailed(
            "Permission denied (publickey)".to_string(),
        ))
    }
}

struct Rule {
    pattern: String,
    /// Reply before `switch_at`, if the rule changes over time.
    before: Option<(Duration, Reply)>,
    reply: Reply,
}

/// Remote executor with canned replies.
///
/// The first rule whose pattern is a substring of the command wins; other
/// commands get the default reply (exit 0).
pub struct ScriptedExecutor {
    epoch: Instant,
    rules: Vec<Rule>,
    default: Reply,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            rules: Vec::new(),
            default: Reply::exit(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply to commands containing `pattern`.
    pub fn on(mut self, pattern: impl Into<String>, reply: Reply) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            before: None,
            reply,
        });
        self
    }

    /// Reply with `before` until `switch_at` after creation, then with `after`.
    pub fn on_after(
        mut self,
        pattern: impl Into<String>,
        switch_at: Duration,
        before: Reply,
        after: Reply,
    ) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            before: Some((switch_at, before)),
            reply: after,
        });
        self
    }

    /// Reply used when no rule matches.
    pub fn otherwise(mut self, reply: Reply) -> Self {
        self.default = reply;
        self
    }

    /// Every command executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of executed commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    fn reply_for(&self, command: &str) -> Reply {
        let Some(rule) = self.rules.iter().find(|r| command.contains(&r.pattern)) else {
            return self.default.clone();
        };
        match &rule.before {
            Some((switch_at, before)) if self.epoch.elapsed() < *switch_at => before.clone(),
            _ => rule.reply.clone(),
        }
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _target: &Coordinates,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(command.to_string());
        }

        let reply = self.reply_for(command);
        debug!(command, ?reply, "[SCRIPTED] Executing");

        match reply {
            Reply::Exit {
                code,
                stdout,
                stderr,
            } => Ok(CommandOutput {
                exit_code: code,
                stdout,
                stderr,
            }),
            Reply::Error(err) => Err(err),
            Reply::Hang => {
                tokio::time::sleep(timeout).await;
                Err(ExecError::Timeout(timeout))
            }
        }
    }
}
