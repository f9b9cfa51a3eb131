//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! adapters that touch the host: environment provisioning, command execution
//! and deployment.

use crate::error::ProvisionError;
use crate::job::JobSpec;
use crate::run::{DeployOutcome, FailureReason, JobStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Output line from command execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A ready-to-use execution context for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedEnvironment {
    pub workdir: PathBuf,
    /// Directories prepended to `PATH`, runtime first.
    pub path_prefix: Vec<PathBuf>,
    /// Variables visible to every command of the job.
    pub env: BTreeMap<String, String>,
}

/// Terminal state reported by a job runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: JobStatus,
    pub reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
}

impl RunOutcome {
    pub fn success() -> Self {
        Self {
            status: JobStatus::Success,
            reason: None,
            exit_code: Some(0),
        }
    }

    pub fn failure(reason: FailureReason, exit_code: Option<i32>) -> Self {
        Self {
            status: JobStatus::Failure,
            reason: Some(reason),
            exit_code,
        }
    }

    pub fn error(reason: FailureReason) -> Self {
        Self {
            status: JobStatus::Error,
            reason: Some(reason),
            exit_code: None,
        }
    }
}

/// Materializes the runtime and auxiliary services a job needs.
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Prepare the environment. Services already started for an earlier job
    /// are reused.
    async fn provision(&self, job: &JobSpec) -> Result<ProvisionedEnvironment, ProvisionError>;

    /// Release the job's context. Called after every successful provision,
    /// whatever the job's outcome.
    async fn teardown(&self, job: &JobSpec, env: ProvisionedEnvironment);

    /// Release whatever outlived individual jobs. Called once, after the
    /// last job of a build.
    async fn shutdown(&self) {}
}

/// Runs a job's install and script phases.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Execute the job, streaming output to the provided channel.
    async fn run(
        &self,
        job: &JobSpec,
        env: &ProvisionedEnvironment,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> RunOutcome;
}

/// A deploy command invocation, outside any job context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub commands: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
}

/// Executes the deploy commands once.
#[async_trait]
pub trait DeployExecutor: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> DeployOutcome;
}
