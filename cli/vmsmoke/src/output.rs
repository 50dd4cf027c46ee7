//! Output formatting for CLI commands.

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};
use vmsmoke_readiness::diagnostics::CaptureResult;
use vmsmoke_readiness::{
    Outcome, PhaseRecord, PhaseStatus, RunSummary, SessionReport, TeardownStatus,
};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Output bytes shown per captured stream in table mode.
const DISPLAY_TAIL: usize = 2048;

/// Print a single item as pretty JSON.
pub fn print_single<T: Serialize + ?Sized>(data: &T) {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    println!("{}", json);
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "Warning:".yellow().bold(), message);
}

#[derive(Debug, Tabled)]
struct PhaseRow {
    #[tabled(rename = "Phase")]
    name: String,

    #[tabled(rename = "Kind")]
    kind: &'static str,

    #[tabled(rename = "Status")]
    status: &'static str,

    #[tabled(rename = "Attempts")]
    attempts: u32,

    #[tabled(rename = "Started")]
    started: String,

    #[tabled(rename = "Elapsed")]
    elapsed: String,

    #[tabled(rename = "Reason")]
    reason: String,
}

impl From<&PhaseRecord> for PhaseRow {
    fn from(record: &PhaseRecord) -> Self {
        let not_run = record.status == PhaseStatus::NotRun;
        Self {
            name: record.name.clone(),
            kind: record.kind,
            status: record.status.as_str(),
            attempts: record.attempts,
            started: if not_run {
                "-".to_string()
            } else {
                format_secs(record.started_at.as_secs_f64())
            },
            elapsed: if not_run {
                "-".to_string()
            } else {
                format_secs(record.elapsed.as_secs_f64())
            },
            reason: record.reason_code.unwrap_or("-").to_string(),
        }
    }
}

fn format_secs(secs: f64) -> String {
    format!("{:.1}s", secs)
}

/// Print a run in the specified format.
pub fn print_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_single(summary),
        OutputFormat::Table => {
            for report in &summary.sessions {
                print_session(report);
                println!();
            }
            println!(
                "{} passed, {} failed, {} timed out",
                summary.passed.to_string().green(),
                summary.failed.to_string().red(),
                summary.timed_out.to_string().yellow()
            );
        }
    }
}

fn print_session(report: &SessionReport) {
    let verdict = match &report.outcome {
        Outcome::Passed => "PASSED".green().bold(),
        Outcome::Failed { .. } => "FAILED".red().bold(),
        Outcome::TimedOut { .. } => "TIMED OUT".yellow().bold(),
    };
    println!(
        "{} {} ({}) {}",
        verdict,
        report.target.bold(),
        report.session_id,
        format_secs(report.elapsed.as_secs_f64()).dimmed()
    );

    if !report.phases.is_empty() {
        let rows: Vec<PhaseRow> = report.phases.iter().map(PhaseRow::from).collect();
        println!("{}", Table::new(rows));
    }

    if !report.outcome.is_passed() {
        println!("{} {}", "Reason:".bold(), report.outcome);
        if let Some(phase) = &report.last_completed_phase {
            println!("{} {}", "Last completed phase:".bold(), phase);
        }
    }

    for warning in &report.warnings {
        print_warning(warning);
    }

    if let Some(diagnostics) = &report.diagnostics {
        if let Some(capture) = &diagnostics.command_output {
            println!("{} {} (exit {})", "Command:".bold(), capture.command, capture.exit_code);
            print_stream("stdout", &capture.stdout);
            print_stream("stderr", &capture.stderr);
        }
        if let Some(last) = diagnostics.attempts.last() {
            println!(
                "{} {} attempt(s) kept, last #{}",
                "Attempts:".bold(),
                diagnostics.attempts.len(),
                last.number
            );
        }
        for log in &diagnostics.remote_logs {
            match &log.result {
                CaptureResult::Captured { exit_code, output } => {
                    println!("{} {} (exit {})", "Log:".bold(), log.command, exit_code);
                    print_stream("output", output);
                }
                CaptureResult::Failed { error } => {
                    println!("{} {} {}", "Log:".bold(), log.command, error.dimmed());
                }
            }
        }
        if let Some(console) = &diagnostics.console_tail {
            print_stream("console", console);
        }
    }

    if let Some(TeardownStatus::Failed { error }) = &report.teardown {
        print_warning(&format!("environment release failed: {}", error));
    }
}

fn print_stream(label: &str, text: &str) {
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }
    println!("  {}:", label.dimmed());
    for line in vmsmoke_readiness::executor::tail(text, DISPLAY_TAIL).lines() {
        println!("    {}", line);
    }
}
