//! Build report rendering.

use crate::config::OutputFormat;
use console::style;
use serde::Serialize;
use trellis_core::ids::BuildId;
use trellis_core::run::{BuildResult, BuildStatus, DeployOutcome, ExecutionResult, JobStatus};

/// Lines of output shown for each job that did not succeed.
const OUTPUT_TAIL_LINES: usize = 20;

/// Serialized form of a finished run.
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub name: &'a str,
    pub build_id: BuildId,
    pub status: BuildStatus,
    pub passed: usize,
    pub failed: usize,
    pub results: &'a [ExecutionResult],
    pub deploy: &'a DeployOutcome,
}

impl<'a> Report<'a> {
    pub fn new(name: &'a str, build: &'a BuildResult, deploy: &'a DeployOutcome) -> Self {
        Self {
            name,
            build_id: build.build_id,
            status: build.status(),
            passed: build.passed(),
            failed: build.failed(),
            results: &build.results,
            deploy,
        }
    }

    pub fn render(&self, format: OutputFormat) -> anyhow::Result<String> {
        Ok(match format {
            OutputFormat::Table => self.table(),
            OutputFormat::Json => serde_json::to_string_pretty(self)?,
            OutputFormat::Yaml => serde_yaml::to_string(self)?,
        })
    }

    fn table(&self) -> String {
        let mut out = String::new();
        let width = self.results.iter().map(|r| r.label.len()).max().unwrap_or(0);

        out.push_str(&format!("\n{}\n", style("Jobs").bold()));
        for result in self.results {
            out.push_str(&format!(
                "  {} [{}] {:<width$}  {}\n",
                status_icon(result),
                result.index,
                result.label,
                style(describe(result)).dim(),
                width = width
            ));
        }

        for result in self.results.iter().filter(|r| !r.status.is_success()) {
            if result.output.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{} {}\n", style("──").dim(), style(&result.label).bold()));
            let lines: Vec<&str> = result.output.lines().collect();
            let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
            for line in &lines[start..] {
                out.push_str(&format!("  | {}\n", line));
            }
        }

        out.push('\n');
        let summary = format!("{} passed, {} failed", self.passed, self.failed);
        match self.status {
            BuildStatus::Success => out.push_str(&format!(
                "{} Build passed ({})\n",
                style("✓").green().bold(),
                summary
            )),
            BuildStatus::Failure => out.push_str(&format!(
                "{} Build failed ({})\n",
                style("✗").red().bold(),
                summary
            )),
            BuildStatus::Cancelled => out.push_str(&format!(
                "{} Build cancelled ({})\n",
                style("!").yellow().bold(),
                summary
            )),
        }

        out.push_str(&format!("{}\n", deploy_line(self.deploy)));
        out
    }
}

fn status_icon(result: &ExecutionResult) -> String {
    match result.status {
        JobStatus::Success => style("✓").green().to_string(),
        JobStatus::Cancelled => style("-").yellow().to_string(),
        _ if result.allow_failure => style("✗").yellow().to_string(),
        _ => style("✗").red().to_string(),
    }
}

fn describe(result: &ExecutionResult) -> String {
    let duration = result
        .duration_ms()
        .map(|ms| format!("{:.2}s", ms as f64 / 1000.0))
        .unwrap_or_default();
    match (&result.reason, result.allow_failure) {
        (Some(reason), true) => format!("{} {} (allowed)", duration, reason),
        (Some(reason), false) => format!("{} {}", duration, reason),
        (None, _) => duration,
    }
}

/// One-line deploy summary, printed as its own section.
pub fn deploy_line(deploy: &DeployOutcome) -> String {
    match deploy {
        DeployOutcome::NotRun { reason } => {
            format!("{} Deploy skipped: {}", style("i").blue(), reason)
        }
        DeployOutcome::Succeeded { .. } => format!("{} Deploy succeeded", style("✓").green()),
        DeployOutcome::Failed { exit_code, output } => {
            let code = exit_code.map_or_else(|| "no exit code".to_string(), |c| format!("exit {}", c));
            let mut line = format!("{} Deploy failed ({})", style("✗").red(), code);
            for l in output.lines() {
                line.push_str(&format!("\n  | {}", l));
            }
            line
        }
    }
}
