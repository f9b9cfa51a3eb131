//! Main scheduler orchestration.
//!
//! Runs every job of a matrix under a concurrency limit and collects one
//! result per job, in input order. Failures never cancel siblings; only an
//! external cancel does.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};
use trellis_core::ids::BuildId;
use trellis_core::job::JobSpec;
use trellis_core::ports::{EnvironmentProvisioner, JobRunner, OutputLine, RunOutcome};
use trellis_core::run::{BuildResult, ExecutionResult, FailureReason, JobStatus};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once.
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Handle used to abort a running build.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every job that is not yet terminal.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Exclusive per-port leases. A job holds the lease for each of its ports from
/// before provisioning until its context is torn down.
#[derive(Debug, Clone, Default)]
struct PortLeases {
    locks: Arc<Mutex<HashMap<u16, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PortLeases {
    /// Acquire leases in ascending port order so two jobs can never wait on
    /// each other.
    async fn acquire(&self, ports: &[u16]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(ports.len());
        for port in ports {
            let lock = {
                let mut locks = self
                    .locks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                locks.entry(*port).or_default().clone()
            };
            guards.push(lock.lock_owned().await);
        }
        guards
    }
}

/// The matrix scheduler.
pub struct Scheduler {
    provisioner: Arc<dyn EnvironmentProvisioner>,
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    ports: PortLeases,
    cancel_tx: watch::Sender<bool>,
}

/// Shared pieces each job task needs.
#[derive(Clone)]
struct TaskContext {
    provisioner: Arc<dyn EnvironmentProvisioner>,
    runner: Arc<dyn JobRunner>,
    ports: PortLeases,
    semaphore: Arc<Semaphore>,
    cancel_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        provisioner: Arc<dyn EnvironmentProvisioner>,
        runner: Arc<dyn JobRunner>,
        config: SchedulerConfig,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            provisioner,
            runner,
            config,
            ports: PortLeases::default(),
            cancel_tx,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Execute all jobs and wait until each has a terminal result.
    pub async fn run(&self, jobs: Vec<JobSpec>) -> BuildResult {
        let build_id = BuildId::new();
        let max_parallel = self.config.max_parallel.max(1);
        info!(build_id = %build_id, jobs = jobs.len(), max_parallel, "Starting build");

        let ctx = TaskContext {
            provisioner: Arc::clone(&self.provisioner),
            runner: Arc::clone(&self.runner),
            ports: self.ports.clone(),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            cancel_rx: self.cancel_tx.subscribe(),
        };

        let headers: Vec<(usize, String, bool)> = jobs
            .iter()
            .map(|j| (j.index, j.label.clone(), j.allow_failure))
            .collect();

        let mut join_set = JoinSet::new();
        for (position, job) in jobs.into_iter().enumerate() {
            let ctx = ctx.clone();
            join_set.spawn(async move { (position, execute_job(job, ctx).await) });
        }

        // Results are slotted by input position, whatever the completion order
        let mut slots: Vec<Option<ExecutionResult>> = vec![None; headers.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((position, result)) => slots[position] = Some(result),
                Err(e) => error!(error = %e, "Job task aborted"),
            }
        }

        let results = slots
            .into_iter()
            .zip(headers)
            .map(|(slot, (index, label, allow_failure))| {
                slot.unwrap_or_else(|| ExecutionResult {
                    index,
                    label,
                    status: JobStatus::Error,
                    reason: Some(FailureReason::Spawn {
                        message: "job task aborted".to_string(),
                    }),
                    exit_code: None,
                    output: String::new(),
                    started_at: None,
                    finished_at: Utc::now(),
                    allow_failure,
                })
            })
            .collect();

        self.provisioner.shutdown().await;

        let build = BuildResult::new(build_id, results);
        info!(
            build_id = %build_id,
            status = ?build.status(),
            passed = build.passed(),
            failed = build.failed(),
            "Build finished"
        );
        build
    }
}

/// Resolves once cancellation is signalled. Never resolves if the sender is
/// gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn collect_output(mut rx: mpsc::Receiver<OutputLine>) -> String {
    let mut output = String::new();
    while let Some(line) = rx.recv().await {
        output.push_str(&line.content);
        output.push('\n');
    }
    output
}

fn cancelled_outcome() -> RunOutcome {
    RunOutcome {
        status: JobStatus::Cancelled,
        reason: Some(FailureReason::Cancelled),
        exit_code: None,
    }
}

fn timed_out_outcome(job: &JobSpec) -> RunOutcome {
    RunOutcome::failure(
        FailureReason::TimedOut {
            after_secs: job.timeout_secs,
        },
        None,
    )
}

fn finish(
    job: &JobSpec,
    outcome: RunOutcome,
    output: String,
    started_at: Option<chrono::DateTime<Utc>>,
) -> ExecutionResult {
    ExecutionResult {
        index: job.index,
        label: job.label.clone(),
        status: outcome.status,
        reason: outcome.reason,
        exit_code: outcome.exit_code,
        output,
        started_at,
        finished_at: Utc::now(),
        allow_failure: job.allow_failure,
    }
}

async fn execute_job(job: JobSpec, ctx: TaskContext) -> ExecutionResult {
    let TaskContext {
        provisioner,
        runner,
        ports,
        semaphore,
        mut cancel_rx,
    } = ctx;

    // Port leases first, then a slot: nobody holds a slot while waiting on a port
    let job_ports = job.ports();
    let _leases = tokio::select! {
        biased;
        _ = cancelled(&mut cancel_rx) => return finish(&job, cancelled_outcome(), String::new(), None),
        leases = ports.acquire(&job_ports) => leases,
    };

    let _permit = tokio::select! {
        biased;
        _ = cancelled(&mut cancel_rx) => return finish(&job, cancelled_outcome(), String::new(), None),
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                let outcome = RunOutcome::error(FailureReason::Spawn {
                    message: "scheduler closed".to_string(),
                });
                return finish(&job, outcome, String::new(), None);
            }
        },
    };

    let started_at = Utc::now();
    let deadline = Instant::now() + job.timeout();
    info!(index = job.index, job = %job.label, "Job started");

    let provisioned = tokio::select! {
        biased;
        _ = cancelled(&mut cancel_rx) => Err(cancelled_outcome()),
        res = timeout_at(deadline, provisioner.provision(&job)) => match res {
            Ok(Ok(env)) => Ok(env),
            Ok(Err(e)) => {
                warn!(job = %job.label, error = %e, "Provisioning failed");
                Err(RunOutcome::failure(FailureReason::Provision { message: e.to_string() }, None))
            }
            Err(_) => Err(timed_out_outcome(&job)),
        },
    };

    let env = match provisioned {
        Ok(env) => env,
        Err(outcome) => return finish(&job, outcome, String::new(), Some(started_at)),
    };

    let (output_tx, output_rx) = mpsc::channel(256);
    let collector = tokio::spawn(collect_output(output_rx));

    // Dropping the runner future on cancel or timeout kills its child process
    let outcome = tokio::select! {
        biased;
        _ = cancelled(&mut cancel_rx) => cancelled_outcome(),
        res = timeout_at(deadline, runner.run(&job, &env, output_tx)) => match res {
            Ok(outcome) => outcome,
            Err(_) => timed_out_outcome(&job),
        },
    };

    provisioner.teardown(&job, env).await;

    let output = collector.await.unwrap_or_default();

    match outcome.status {
        JobStatus::Success => info!(job = %job.label, "Job succeeded"),
        _ => warn!(
            job = %job.label,
            status = ?outcome.status,
            reason = ?outcome.reason,
            "Job did not succeed"
        ),
    }

    finish(&job, outcome, output, Some(started_at))
}
