//! Deployment gate evaluation.
//!
//! The gate runs once per build, after every job is terminal. It never runs
//! against a failing build and its own outcome never changes the build status.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use trellis_core::definition::{DeployConfig, MatrixDefinition};
use trellis_core::job::{JobSpec, is_truthy};
use trellis_core::ports::{DeployExecutor, DeployRequest};
use trellis_core::run::{BuildStatus, DeployOutcome, GateSkip};

/// Result of evaluating the deploy condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Deploy,
    Skip(GateSkip),
}

/// Gate that decides on and runs the deploy command.
pub struct DeployGate {
    executor: Arc<dyn DeployExecutor>,
    workspace: PathBuf,
}

impl DeployGate {
    pub fn new(executor: Arc<dyn DeployExecutor>, workspace: PathBuf) -> Self {
        Self {
            executor,
            workspace,
        }
    }

    /// Evaluate the condition for a finished build.
    pub fn evaluate(
        definition: &MatrixDefinition,
        jobs: &[JobSpec],
        status: BuildStatus,
        branch: Option<&str>,
    ) -> GateDecision {
        if !status.is_success() {
            return GateDecision::Skip(GateSkip::BuildNotSuccessful { status });
        }
        Self::check(definition, jobs, branch)
    }

    /// Evaluate the condition alone, as if the build had succeeded.
    pub fn check(
        definition: &MatrixDefinition,
        jobs: &[JobSpec],
        branch: Option<&str>,
    ) -> GateDecision {
        let Some(deploy) = &definition.deploy else {
            return GateDecision::Skip(GateSkip::NotConfigured);
        };

        if branch != Some(deploy.branch.as_str()) {
            return GateDecision::Skip(GateSkip::BranchMismatch {
                expected: deploy.branch.clone(),
                actual: branch.map(str::to_string),
            });
        }

        if !flag_is_set(definition, deploy, jobs) {
            return GateDecision::Skip(GateSkip::FlagUnset {
                flag: deploy.flag.clone(),
            });
        }

        GateDecision::Deploy
    }

    /// Evaluate the condition and, if met, run the deploy commands once.
    pub async fn run(
        &self,
        definition: &MatrixDefinition,
        jobs: &[JobSpec],
        status: BuildStatus,
        branch: Option<&str>,
    ) -> DeployOutcome {
        match Self::evaluate(definition, jobs, status, branch) {
            GateDecision::Skip(reason) => {
                info!(reason = %reason, "Deploy skipped");
                DeployOutcome::NotRun { reason }
            }
            GateDecision::Deploy => {
                let Some(deploy) = &definition.deploy else {
                    return DeployOutcome::NotRun {
                        reason: GateSkip::NotConfigured,
                    };
                };
                let request = self.request(definition, deploy);
                info!(commands = request.commands.len(), "Running deploy");
                let outcome = self.executor.deploy(&request).await;
                if let DeployOutcome::Failed { exit_code, .. } = &outcome {
                    warn!(exit_code = ?exit_code, "Deploy failed");
                }
                outcome
            }
        }
    }

    fn request(&self, definition: &MatrixDefinition, deploy: &DeployConfig) -> DeployRequest {
        let mut env = definition.env.clone();
        env.extend(deploy.env.clone());
        let workdir = match &deploy.workdir {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        };
        DeployRequest {
            commands: deploy.run.clone(),
            env,
            workdir,
        }
    }
}

/// The flag counts as set when the global env, the deploy env, or any job
/// sets it to a truthy value.
fn flag_is_set(definition: &MatrixDefinition, deploy: &DeployConfig, jobs: &[JobSpec]) -> bool {
    let truthy = |value: Option<&String>| value.is_some_and(|v| is_truthy(v));
    truthy(definition.env.get(&deploy.flag))
        || truthy(deploy.env.get(&deploy.flag))
        || jobs.iter().any(|job| truthy(job.env.get(&deploy.flag)))
}
