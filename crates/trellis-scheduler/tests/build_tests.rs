//! End-to-end build tests: expand a fixture matrix, schedule it against
//! in-memory ports and evaluate the deploy gate.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use trellis_core::ProvisionError;
use trellis_core::definition::MatrixDefinition;
use trellis_core::job::JobSpec;
use trellis_core::ports::*;
use trellis_core::run::{BuildStatus, DeployOutcome, FailureReason, GateSkip, JobStatus};
use trellis_scheduler::{DeployGate, MatrixExpander, Scheduler, SchedulerConfig, select_job};

fn fixture() -> MatrixDefinition {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/psycopg3.yaml");
    MatrixDefinition::load(&path).expect("fixture loads")
}

struct InMemoryProvisioner;

#[async_trait]
impl EnvironmentProvisioner for InMemoryProvisioner {
    async fn provision(&self, job: &JobSpec) -> Result<ProvisionedEnvironment, ProvisionError> {
        Ok(ProvisionedEnvironment {
            workdir: PathBuf::from("/work"),
            path_prefix: vec![PathBuf::from(format!("/opt/python/{}/bin", job.runtime.version))],
            env: job.env.clone(),
        })
    }

    async fn teardown(&self, _job: &JobSpec, _env: ProvisionedEnvironment) {}
}

/// Fails the script of every job whose label appears in `failing`.
struct ScriptedRunner {
    failing: Vec<String>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn failing(labels: &[&str]) -> Self {
        Self {
            failing: labels.iter().map(|l| l.to_string()).collect(),
            seen: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(
        &self,
        job: &JobSpec,
        _env: &ProvisionedEnvironment,
        _output_tx: mpsc::Sender<OutputLine>,
    ) -> RunOutcome {
        self.seen.lock().unwrap().push(job.label.clone());
        if self.failing.contains(&job.label) {
            RunOutcome::failure(
                FailureReason::ScriptFailed {
                    command: job.script[0].clone(),
                    exit_code: 1,
                },
                Some(1),
            )
        } else {
            RunOutcome::success()
        }
    }
}

#[derive(Default)]
struct CountingExecutor {
    calls: Mutex<usize>,
}

#[async_trait]
impl DeployExecutor for CountingExecutor {
    async fn deploy(&self, _request: &DeployRequest) -> DeployOutcome {
        *self.calls.lock().unwrap() += 1;
        DeployOutcome::Succeeded {
            exit_code: 0,
            output: String::new(),
        }
    }
}

fn expand(def: &MatrixDefinition) -> Vec<JobSpec> {
    MatrixExpander::new(def).unwrap().expand().unwrap()
}

#[test]
fn test_fixture_expands_to_seven_jobs() {
    let def = fixture();
    let jobs = expand(&def);

    assert_eq!(jobs.len(), 7);
    assert_eq!(jobs[0].label, "python 3.6 (impl=c, postgres=10)");
    assert_eq!(jobs[0].services[0].port, 5433);
    assert_eq!(jobs[2].services[0].port, 5432);
    assert_eq!(jobs[2].env["PSYCOPG3_TEST_DSN"], "dbname=psycopg3_test host=localhost port=5432");
    assert_eq!(jobs[4].settings.test_filter.as_deref(), Some("-m 'not slow'"));
    assert!(jobs[5].allow_failure);
    assert!(jobs[6].settings.docs);
    assert!(jobs.iter().all(|j| j.timeout_secs == 30 * 60));
}

#[tokio::test]
async fn test_green_build_deploys_once() {
    let def = fixture();
    let jobs = expand(&def);
    let runner = Arc::new(ScriptedRunner::failing(&[]));
    let scheduler = Scheduler::new(
        Arc::new(InMemoryProvisioner),
        runner.clone(),
        SchedulerConfig { max_parallel: 3 },
    );

    let build = scheduler.run(jobs.clone()).await;
    assert_eq!(build.status(), BuildStatus::Success);
    assert_eq!(runner.seen.lock().unwrap().len(), 7);

    let executor = Arc::new(CountingExecutor::default());
    let gate = DeployGate::new(executor.clone(), PathBuf::from("/work"));
    let outcome = gate.run(&def, &jobs, build.status(), Some("master")).await;

    assert!(outcome.ran());
    assert_eq!(*executor.calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_allowed_failure_keeps_build_green() {
    let def = fixture();
    let jobs = expand(&def);
    let allowed = jobs[5].label.clone();
    let scheduler = Scheduler::new(
        Arc::new(InMemoryProvisioner),
        Arc::new(ScriptedRunner::failing(&[allowed.as_str()])),
        SchedulerConfig { max_parallel: 4 },
    );

    let build = scheduler.run(jobs).await;

    assert_eq!(build.results[5].status, JobStatus::Failure);
    assert_eq!(build.status(), BuildStatus::Success);
}

#[tokio::test]
async fn test_red_build_never_deploys() {
    let def = fixture();
    let jobs = expand(&def);
    let broken = jobs[3].label.clone();
    let scheduler = Scheduler::new(
        Arc::new(InMemoryProvisioner),
        Arc::new(ScriptedRunner::failing(&[broken.as_str()])),
        SchedulerConfig { max_parallel: 4 },
    );

    let build = scheduler.run(jobs.clone()).await;
    assert_eq!(build.status(), BuildStatus::Failure);
    assert_eq!(build.passed(), 6);

    let executor = Arc::new(CountingExecutor::default());
    let gate = DeployGate::new(executor.clone(), PathBuf::from("/work"));
    let outcome = gate.run(&def, &jobs, build.status(), Some("master")).await;

    assert_eq!(
        outcome,
        DeployOutcome::NotRun {
            reason: GateSkip::BuildNotSuccessful {
                status: BuildStatus::Failure
            }
        }
    );
    assert_eq!(*executor.calls.lock().unwrap(), 0);

    let report = serde_json::to_value(&build).unwrap();
    assert_eq!(report["results"][3]["reason"]["kind"], "script_failed");
}

#[tokio::test]
async fn test_single_job_selection() {
    let def = fixture();
    let job = assert_ok!(select_job(expand(&def), "docs"));
    assert_eq!(job.index, 6);

    let scheduler = Scheduler::new(
        Arc::new(InMemoryProvisioner),
        Arc::new(ScriptedRunner::failing(&[])),
        SchedulerConfig::default(),
    );
    let build = scheduler.run(vec![job]).await;

    assert_eq!(build.results.len(), 1);
    assert_eq!(build.results[0].index, 6);
    assert_eq!(build.results[0].label, "docs");
}
