//! Execution results and build aggregation.

use crate::ids::BuildId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failure,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }

    /// Failure or error: the statuses that fail a build.
    pub fn is_failed(&self) -> bool {
        matches!(self, JobStatus::Failure | JobStatus::Error)
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    InstallFailed { command: String, exit_code: i32 },
    ScriptFailed { command: String, exit_code: i32 },
    TimedOut { after_secs: u64 },
    Provision { message: String },
    Spawn { message: String },
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::InstallFailed { command, exit_code } => {
                write!(f, "install failed (exit {}): {}", exit_code, command)
            }
            FailureReason::ScriptFailed { command, exit_code } => {
                write!(f, "script failed (exit {}): {}", exit_code, command)
            }
            FailureReason::TimedOut { after_secs } => write!(f, "timed out after {}s", after_secs),
            FailureReason::Provision { message } => write!(f, "provisioning failed: {}", message),
            FailureReason::Spawn { message } => write!(f, "could not run command: {}", message),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one job. Produced exactly once per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    pub index: usize,
    pub label: String,
    pub status: JobStatus,
    pub reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub allow_failure: bool,
}

impl ExecutionResult {
    pub fn duration_ms(&self) -> Option<u64> {
        self.started_at
            .map(|start| (self.finished_at - start).num_milliseconds().max(0) as u64)
    }

    /// Whether this result fails the build.
    pub fn fails_build(&self) -> bool {
        !self.allow_failure && self.status.is_failed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
    Cancelled,
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Success)
    }
}

/// All results of one build, in matrix order. The status is always computed
/// from the results, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildResult {
    pub build_id: BuildId,
    pub results: Vec<ExecutionResult>,
}

impl BuildResult {
    pub fn new(build_id: BuildId, results: Vec<ExecutionResult>) -> Self {
        Self { build_id, results }
    }

    pub fn status(&self) -> BuildStatus {
        if self.results.iter().any(ExecutionResult::fails_build) {
            BuildStatus::Failure
        } else if self
            .results
            .iter()
            .any(|r| r.status == JobStatus::Cancelled)
        {
            BuildStatus::Cancelled
        } else {
            BuildStatus::Success
        }
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_failed()).count()
    }
}

/// Why the deployment gate did not run the deploy command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateSkip {
    BuildNotSuccessful { status: BuildStatus },
    NotConfigured,
    BranchMismatch { expected: String, actual: Option<String> },
    FlagUnset { flag: String },
    Disabled,
    PartialBuild { selected: String },
}

impl std::fmt::Display for GateSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateSkip::BuildNotSuccessful { status } => {
                write!(f, "build did not succeed ({:?})", status)
            }
            GateSkip::NotConfigured => write!(f, "no deploy configured"),
            GateSkip::BranchMismatch { expected, actual } => write!(
                f,
                "branch {} does not match {}",
                actual.as_deref().unwrap_or("<unknown>"),
                expected
            ),
            GateSkip::FlagUnset { flag } => write!(f, "{} is not set", flag),
            GateSkip::Disabled => write!(f, "deploy disabled"),
            GateSkip::PartialBuild { selected } => {
                write!(f, "only {} was run, not the full matrix", selected)
            }
        }
    }
}

/// Deployment status, reported independently of the build status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployOutcome {
    NotRun { reason: GateSkip },
    Succeeded { exit_code: i32, output: String },
    Failed { exit_code: Option<i32>, output: String },
}

impl DeployOutcome {
    pub fn ran(&self) -> bool {
        !matches!(self, DeployOutcome::NotRun { .. })
    }
}
