//! Command handlers.

use crate::commands::RunArgs;
use crate::config::CliConfig;
use crate::report::{Report, deploy_line};
use anyhow::Context;
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::definition::MatrixDefinition;
use trellis_core::job::JobSpec;
use trellis_core::run::{BuildResult, DeployOutcome, GateSkip};
use trellis_runner::{
    CommandServiceBackend, HostProvisioner, ProvisionerConfig, RunnerConfig, ShellRunner,
    ToolcacheLocator,
};
use trellis_scheduler::{DeployGate, GateDecision, MatrixExpander, Scheduler, SchedulerConfig, select_job};

/// Environment variable consulted for the branch when `--branch` is absent.
pub const BRANCH_ENV: &str = "TRELLIS_BRANCH";

/// Load and expand a definition. Errors here are definition errors.
pub fn load_jobs(path: &Path) -> anyhow::Result<(MatrixDefinition, Vec<JobSpec>)> {
    let definition = MatrixDefinition::load(path)?;
    let jobs = MatrixExpander::new(&definition)?.expand()?;
    Ok((definition, jobs))
}

/// Branch precedence: flag, then `TRELLIS_BRANCH`, then git.
pub async fn resolve_branch(flag: Option<String>) -> Option<String> {
    if let Some(branch) = flag {
        return Some(branch);
    }
    if let Ok(branch) = std::env::var(BRANCH_ENV)
        && !branch.is_empty()
    {
        return Some(branch);
    }
    git_branch().await
}

async fn git_branch() -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    // Detached HEAD has no branch
    (!branch.is_empty() && branch != "HEAD").then_some(branch)
}

/// Process exit status of a finished build: 0 on success, 1 otherwise.
pub fn build_exit_status(build: &BuildResult) -> u8 {
    if build.status().is_success() { 0 } else { 1 }
}

/// Deploy is skipped without consulting the gate when disabled or when only
/// part of the matrix runs.
pub fn deploy_skip(args: &RunArgs) -> Option<GateSkip> {
    if args.no_deploy {
        Some(GateSkip::Disabled)
    } else {
        args.only.as_ref().map(|selected| GateSkip::PartialBuild {
            selected: selected.clone(),
        })
    }
}

/// Run a matrix definition.
pub async fn run(config: &CliConfig, args: RunArgs) -> anyhow::Result<ExitCode> {
    let (definition, mut jobs) = load_jobs(&args.definition)?;

    if let Some(selector) = &args.only {
        jobs = vec![select_job(jobs, selector)?];
    }
    if let Some(minutes) = args.timeout_minutes {
        for job in &mut jobs {
            job.timeout_secs = u64::from(minutes) * 60;
        }
    }

    let workspace = match args.workspace.clone().or_else(|| config.workspace.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let max_parallel = args
        .max_parallel
        .or(definition.max_parallel.map(|n| n as usize))
        .or(config.max_parallel)
        .unwrap_or_else(|| SchedulerConfig::default().max_parallel);
    let format = args.format.unwrap_or(config.output_format);
    let branch = resolve_branch(args.branch.clone()).await;
    debug!(branch = ?branch, workspace = %workspace.display(), "Resolved run settings");

    if format == crate::config::OutputFormat::Table {
        println!(
            "\n{} Running matrix: {}",
            style("▶").cyan().bold(),
            style(&definition.name).bold()
        );
        println!("  {} jobs, max parallel {}", jobs.len(), max_parallel);
    }

    let provisioner = HostProvisioner::new(
        ProvisionerConfig {
            workspace: workspace.clone(),
            addon_command: config.addon_command.clone(),
            shell: config.shell.clone(),
            ..Default::default()
        },
        Arc::new(ToolcacheLocator::new(config.toolcache.clone())),
        Arc::new(CommandServiceBackend::new(config.shell.clone())),
    );
    let runner = Arc::new(ShellRunner::new(RunnerConfig {
        shell: config.shell.clone(),
        inherit_env: config.inherit_env.clone(),
        ..Default::default()
    }));

    let scheduler = Scheduler::new(
        Arc::new(provisioner),
        runner.clone(),
        SchedulerConfig { max_parallel },
    );

    let cancel = scheduler.cancel_handle();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling build");
                cancel.cancel();
            }
        })
    };

    let build = scheduler.run(jobs.clone()).await;
    interrupt.abort();

    if cancel.is_cancelled() {
        warn!("Build was cancelled");
    }

    let deploy = match deploy_skip(&args) {
        Some(reason) => DeployOutcome::NotRun { reason },
        None => {
            DeployGate::new(runner, workspace)
                .run(&definition, &jobs, build.status(), branch.as_deref())
                .await
        }
    };

    let report = Report::new(&definition.name, &build, &deploy);
    println!("{}", report.render(format)?);

    Ok(ExitCode::from(build_exit_status(&build)))
}

/// Evaluate the deploy condition without running any job.
pub async fn deploy_check(definition: &Path, branch: Option<String>) -> anyhow::Result<ExitCode> {
    let (definition, jobs) = load_jobs(definition)?;
    let branch = resolve_branch(branch).await;

    match DeployGate::check(&definition, &jobs, branch.as_deref()) {
        GateDecision::Deploy => {
            println!(
                "{} Deploy would run on {}",
                style("✓").green(),
                style(branch.as_deref().unwrap_or_default()).bold()
            );
            Ok(ExitCode::SUCCESS)
        }
        GateDecision::Skip(reason) => {
            println!("{}", deploy_line(&DeployOutcome::NotRun { reason }));
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Validate a definition and list its jobs.
pub fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let (definition, jobs) = load_jobs(path)?;

    println!(
        "{} Matrix \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {}", jobs.len());

    for job in &jobs {
        let services: Vec<String> = job
            .services
            .iter()
            .map(|s| format!("{}:{}", s.key(), s.port))
            .collect();
        let mut line = format!("    [{}] {}", job.index, job.label);
        if !services.is_empty() {
            line.push_str(&format!(" {}", style(services.join(", ")).dim()));
        }
        if job.allow_failure {
            line.push_str(&format!(" {}", style("(allowed to fail)").yellow()));
        }
        println!("{}", line);
    }

    Ok(ExitCode::SUCCESS)
}

/// Print the definition JSON schema.
pub fn schema() -> anyhow::Result<ExitCode> {
    let schema = schemars::schema_for!(MatrixDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(ExitCode::SUCCESS)
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<ExitCode> {
    let show = |p: &Option<PathBuf>| {
        p.as_ref()
            .map_or_else(|| "(not set)".to_string(), |p| p.display().to_string())
    };

    println!("Current configuration:");
    println!(
        "  max_parallel: {}",
        config
            .max_parallel
            .map_or_else(|| "(auto)".to_string(), |n| n.to_string())
    );
    println!("  workspace: {}", show(&config.workspace));
    println!("  toolcache: {}", show(&config.toolcache));
    println!("  shell: {}", config.shell);
    println!("  inherit_env: {}", config.inherit_env.join(","));
    println!(
        "  addon_command: {}",
        config.addon_command.as_deref().unwrap_or("(not set)")
    );
    println!("  output_format: {:?}", config.output_format);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(ExitCode::SUCCESS)
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<ExitCode> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value).map_err(anyhow::Error::msg)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(ExitCode::SUCCESS)
}
