//! Best-effort diagnostics captured when a run fails.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::coordinates::Coordinates;
use crate::executor::{tail, RemoteExecutor, MAX_CAPTURE_BYTES};
use crate::probe::Attempt;

/// Remote commands run on failure unless configured otherwise.
pub const DEFAULT_DIAGNOSTIC_COMMANDS: &[&str] =
    &["cloud-init status --long", "journalctl -n 200 --no-pager"];

/// Output of a failed one-shot command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandCapture {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Result of one remote log command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CaptureResult {
    Captured { exit_code: i32, output: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LogCapture {
    pub command: String,
    #[serde(flatten)]
    pub result: CaptureResult,
}

/// Everything gathered about a failed phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    /// Output of the failing command phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_output: Option<CommandCapture>,
    /// Last attempts of the failing probe.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remote_logs: Vec<LogCapture>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_tail: Option<String>,
}

/// Collects remote logs and the local console tail under a fixed budget.
pub struct DiagnosticCollector {
    executor: Arc<dyn RemoteExecutor>,
    commands: Vec<String>,
    timeout: Duration,
    console_tail_bytes: usize,
}

impl DiagnosticCollector {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        commands: Vec<String>,
        timeout: Duration,
        console_tail_bytes: usize,
    ) -> Self {
        Self {
            executor,
            commands,
            timeout,
            console_tail_bytes,
        }
    }

    /// Run every diagnostic command and read the console tail concurrently.
    ///
    /// Each remote command is bounded by the collector timeout; nothing here
    /// can fail the run.
    pub async fn collect(
        &self,
        target: &Coordinates,
        console_log: Option<&Path>,
    ) -> (Vec<LogCapture>, Option<String>) {
        let remote = join_all(self.commands.iter().map(|command| async move {
            let run = self.executor.execute(target, command, self.timeout);
            let result = match tokio::time::timeout(self.timeout, run).await {
                Ok(Ok(output)) => {
                    let mut text = output.stdout;
                    if !output.stderr.is_empty() {
                        text.push_str(&output.stderr);
                    }
                    CaptureResult::Captured {
                        exit_code: output.exit_code,
                        output: tail(&text, MAX_CAPTURE_BYTES),
                    }
                }
                Ok(Err(e)) => {
                    debug!(command = %command, error = %e, "Diagnostic command failed");
                    CaptureResult::Failed {
                        error: e.to_string(),
                    }
                }
                Err(_) => CaptureResult::Failed {
                    error: format!("no output within {}s", self.timeout.as_secs()),
                },
            };
            LogCapture {
                command: command.clone(),
                result,
            }
        }));

        let console = async {
            let path = console_log?;
            match tokio::time::timeout(self.timeout, read_tail(path, self.console_tail_bytes)).await
            {
                Ok(Ok(text)) => Some(text),
                Ok(Err(e)) => {
                    debug!(path = %path.display(), error = %e, "Console log unreadable");
                    None
                }
                Err(_) => None,
            }
        };

        tokio::join!(remote, console)
    }
}

/// Read at most the last `max_bytes` of a file, lossily decoded.
pub async fn read_tail(path: &Path, max_bytes: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes as u64);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
