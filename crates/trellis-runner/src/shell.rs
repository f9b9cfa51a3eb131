//! Shell-based job execution on the host.

use crate::process::{ProcessGroup, ProcessGroups, shell_command};
use crate::runner::RunnerConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::pin::pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trellis_core::job::JobSpec;
use trellis_core::ports::{
    DeployExecutor, DeployRequest, JobRunner, OutputLine, OutputStream, ProvisionedEnvironment,
    RunOutcome,
};
use trellis_core::run::{DeployOutcome, FailureReason};

/// How long output is still read after the shell has exited.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Shell runner for executing commands on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

/// Which phase a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Install,
    Script,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run one command to completion, streaming its output. Returns the exit
    /// code, `-1` when the process was killed by a signal.
    ///
    /// The command is done when the shell exits. Processes it left in the
    /// background keep running until `groups` is dropped.
    pub async fn execute_command(
        &self,
        command: &str,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        output_tx: mpsc::Sender<OutputLine>,
        groups: &mut ProcessGroups,
    ) -> std::io::Result<i32> {
        let start = std::time::Instant::now();
        info!(command = %command, workdir = %workdir.display(), "Executing shell command");

        if self.config.echo_commands {
            let _ = output_tx
                .send(OutputLine {
                    stream: OutputStream::Stdout,
                    content: format!("$ {}", command),
                    line_number: 0,
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }

        let mut child = shell_command(&self.config.shell, command)
            .current_dir(workdir)
            .env_clear()
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        groups.track(ProcessGroup::of(&child));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Readers live inside this future so dropping it also drops the senders
        let mut readers = pin!(async move {
            tokio::join!(
                stream_lines(stdout, OutputStream::Stdout, output_tx.clone()),
                stream_lines(stderr, OutputStream::Stderr, output_tx),
            );
        });

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            () = &mut readers => None,
        };
        let status = match exited {
            Some(status) => {
                // Background children may hold the pipes open
                if tokio::time::timeout(OUTPUT_DRAIN, readers.as_mut()).await.is_err() {
                    debug!(command = %command, "Output still open after exit, detaching");
                }
                status
            }
            None => child.wait().await,
        };

        let exit_code = status?.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(exit_code, duration_ms, "Command completed");

        Ok(exit_code)
    }

    /// Run commands in order, stopping at the first nonzero exit.
    async fn run_phase(
        &self,
        phase: Phase,
        commands: &[String],
        workdir: &Path,
        env: &BTreeMap<String, String>,
        output_tx: &mpsc::Sender<OutputLine>,
        groups: &mut ProcessGroups,
    ) -> Option<RunOutcome> {
        for command in commands {
            match self
                .execute_command(command, workdir, env, output_tx.clone(), groups)
                .await
            {
                Ok(0) => {}
                Ok(exit_code) => {
                    warn!(command = %command, exit_code, phase = ?phase, "Command failed");
                    let command = command.clone();
                    let reason = match phase {
                        Phase::Install => FailureReason::InstallFailed { command, exit_code },
                        Phase::Script => FailureReason::ScriptFailed { command, exit_code },
                    };
                    return Some(RunOutcome::failure(reason, Some(exit_code)));
                }
                Err(e) => {
                    warn!(command = %command, error = %e, "Failed to spawn command");
                    return Some(RunOutcome::error(FailureReason::Spawn {
                        message: format!("{}: {}", command, e),
                    }));
                }
            }
        }
        None
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

async fn stream_lines<R>(reader: Option<R>, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    let mut line_num = 0u32;

    while let Ok(Some(line)) = lines.next_line().await {
        line_num += 1;
        let output = OutputLine {
            stream,
            content: line,
            line_number: line_num,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(output).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl JobRunner for ShellRunner {
    async fn run(
        &self,
        job: &JobSpec,
        env: &ProvisionedEnvironment,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> RunOutcome {
        let vars = self.config.job_env(env);
        // Dropped on return, timeout or cancellation
        let mut groups = ProcessGroups::new();

        if let Some(outcome) = self
            .run_phase(Phase::Install, &job.install, &env.workdir, &vars, &output_tx, &mut groups)
            .await
        {
            return outcome;
        }

        self.run_phase(Phase::Script, &job.script, &env.workdir, &vars, &output_tx, &mut groups)
            .await
            .unwrap_or_else(RunOutcome::success)
    }
}

#[async_trait]
impl DeployExecutor for ShellRunner {
    async fn deploy(&self, request: &DeployRequest) -> DeployOutcome {
        let env = self.config.compose_env(&request.env, &[]);
        let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
        let collector = tokio::spawn(async move {
            let mut output = String::new();
            while let Some(line) = rx.recv().await {
                output.push_str(&line.content);
                output.push('\n');
            }
            output
        });

        let mut groups = ProcessGroups::new();
        let mut failure = None;
        for command in &request.commands {
            match self
                .execute_command(command, &request.workdir, &env, tx.clone(), &mut groups)
                .await
            {
                Ok(0) => {}
                Ok(code) => {
                    failure = Some((Some(code), None));
                    break;
                }
                Err(e) => {
                    failure = Some((None, Some(format!("{}: {}", command, e))));
                    break;
                }
            }
        }
        drop(tx);
        drop(groups);

        let mut output = collector.await.unwrap_or_default();
        match failure {
            None => DeployOutcome::Succeeded {
                exit_code: 0,
                output,
            },
            Some((exit_code, message)) => {
                if let Some(message) = message {
                    output.push_str(&message);
                }
                DeployOutcome::Failed { exit_code, output }
            }
        }
    }
}
