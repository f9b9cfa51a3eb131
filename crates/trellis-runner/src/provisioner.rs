//! Host environment provisioning: runtimes, addons and auxiliary services.
//!
//! Services outlive the job that started them so later jobs asking for the
//! same service and version on the same port reuse the running instance.
//! Exclusive use of a port during a job is the scheduler's business; the
//! registry here only tracks what is running where. Services this provisioner
//! started are stopped on shutdown; instances found already listening are
//! left alone.

use crate::process::{ProcessGroup, shell_command};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_core::ProvisionError;
use trellis_core::job::{JobSpec, ServiceRequirement};
use trellis_core::ports::{EnvironmentProvisioner, ProvisionedEnvironment};

/// Finds the bin directory of a language runtime.
#[async_trait]
pub trait RuntimeLocator: Send + Sync {
    async fn locate(&self, language: &str, version: &str) -> Option<PathBuf>;
}

/// Starts and probes auxiliary services.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    async fn start(&self, service: &ServiceRequirement) -> Result<(), ProvisionError>;

    async fn is_ready(&self, service: &ServiceRequirement) -> bool;

    async fn create_database(
        &self,
        service: &ServiceRequirement,
        database: &str,
    ) -> Result<(), ProvisionError>;

    async fn stop(&self, service: &ServiceRequirement) -> Result<(), ProvisionError>;
}

/// Run `command` to completion in its own process group. Stdout is discarded
/// and stderr goes to a scratch file, so a daemon the command leaves behind
/// never holds a pipe open. With `detach`, processes left in the group keep
/// running after success; otherwise the group is killed once the command
/// returns.
async fn run_shell(shell: &str, command: &str, detach: bool) -> Result<(), String> {
    let mut stderr = tempfile::tempfile().map_err(|e| e.to_string())?;
    let mut child = shell_command(shell, command)
        .stdout(Stdio::null())
        .stderr(stderr.try_clone().map_err(|e| e.to_string())?)
        .spawn()
        .map_err(|e| e.to_string())?;
    let group = ProcessGroup::of(&child);

    let status = child.wait().await.map_err(|e| e.to_string())?;
    if status.success() {
        if detach {
            group.release();
        }
        return Ok(());
    }

    let mut message = String::new();
    stderr
        .seek(SeekFrom::Start(0))
        .and_then(|_| stderr.read_to_string(&mut message))
        .map_err(|e| e.to_string())?;
    let message = message.trim();
    Err(if message.is_empty() {
        format!("exit code {}", status.code().unwrap_or(-1))
    } else {
        message.to_string()
    })
}

/// Looks for `<root>/<language>/<version>/bin`, then for a
/// `<language><version>` executable on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ToolcacheLocator {
    root: Option<PathBuf>,
}

impl ToolcacheLocator {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

#[async_trait]
impl RuntimeLocator for ToolcacheLocator {
    async fn locate(&self, language: &str, version: &str) -> Option<PathBuf> {
        if let Some(root) = &self.root {
            let bin = root.join(language).join(version).join("bin");
            if tokio::fs::metadata(&bin).await.is_ok_and(|m| m.is_dir()) {
                return Some(bin);
            }
        }

        let executable = format!("{}{}", language, version);
        let path = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path) {
            if tokio::fs::metadata(dir.join(&executable))
                .await
                .is_ok_and(|m| m.is_file())
            {
                return Some(dir);
            }
        }
        None
    }
}

/// Runs the service's `start` and `create_database` commands through a shell
/// and probes readiness with a TCP connect on localhost.
#[derive(Debug, Clone)]
pub struct CommandServiceBackend {
    shell: String,
}

impl CommandServiceBackend {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    async fn run(&self, command: &str, detach: bool) -> Result<(), String> {
        debug!(command = %command, detach, "Running service command");
        run_shell(&self.shell, command, detach).await
    }
}

impl Default for CommandServiceBackend {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl ServiceBackend for CommandServiceBackend {
    async fn start(&self, service: &ServiceRequirement) -> Result<(), ProvisionError> {
        let Some(command) = &service.start else {
            // Externally managed; readiness polling decides
            return Ok(());
        };
        self.run(command, true)
            .await
            .map_err(|message| ProvisionError::ServiceStartFailed {
                service: service.key(),
                message,
            })
    }

    async fn is_ready(&self, service: &ServiceRequirement) -> bool {
        let connect = TcpStream::connect(("127.0.0.1", service.port));
        matches!(
            tokio::time::timeout(Duration::from_secs(1), connect).await,
            Ok(Ok(_))
        )
    }

    async fn create_database(
        &self,
        service: &ServiceRequirement,
        database: &str,
    ) -> Result<(), ProvisionError> {
        let Some(command) = &service.create_database else {
            return Ok(());
        };
        self.run(command, false)
            .await
            .map_err(|message| ProvisionError::DatabaseCreateFailed {
                service: service.key(),
                database: database.to_string(),
                message,
            })
    }

    async fn stop(&self, service: &ServiceRequirement) -> Result<(), ProvisionError> {
        let Some(command) = &service.stop else {
            warn!(service = %service.key(), port = service.port, "No stop command, leaving service running");
            return Ok(());
        };
        self.run(command, false)
            .await
            .map_err(|message| ProvisionError::ServiceStopFailed {
                service: service.key(),
                message,
            })
    }
}

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Root under which job working directories are resolved.
    pub workspace: PathBuf,
    /// Command prefix used to install addons; addon names are appended.
    pub addon_command: Option<String>,
    pub shell: String,
    pub ready_poll_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            addon_command: None,
            shell: "sh".to_string(),
            ready_poll_interval: Duration::from_millis(250),
        }
    }
}

/// What is running on the host.
#[derive(Debug, Default)]
struct Registry {
    /// Port to `name@version`.
    services: HashMap<u16, String>,
    databases: HashSet<(u16, String)>,
    addons: BTreeSet<String>,
    /// Services this provisioner started, by port.
    started: BTreeMap<u16, ServiceRequirement>,
}

/// Provisions jobs directly on the host.
pub struct HostProvisioner {
    config: ProvisionerConfig,
    locator: Arc<dyn RuntimeLocator>,
    backend: Arc<dyn ServiceBackend>,
    registry: Mutex<Registry>,
}

impl HostProvisioner {
    pub fn new(
        config: ProvisionerConfig,
        locator: Arc<dyn RuntimeLocator>,
        backend: Arc<dyn ServiceBackend>,
    ) -> Self {
        Self {
            config,
            locator,
            backend,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn install_addons(&self, job: &JobSpec) -> Result<(), ProvisionError> {
        let Some(prefix) = &self.config.addon_command else {
            return Ok(());
        };
        let missing: Vec<String> = {
            let registry = self.registry();
            job.addons
                .iter()
                .filter(|a| !registry.addons.contains(*a))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let command = format!("{} {}", prefix, missing.join(" "));
        info!(job = %job.label, addons = ?missing, "Installing addons");
        run_shell(&self.config.shell, &command, false)
            .await
            .map_err(|message| ProvisionError::AddonInstallFailed(format!("{}: {}", command, message)))?;

        self.registry().addons.extend(missing);
        Ok(())
    }

    async fn ensure_service(&self, service: &ServiceRequirement) -> Result<(), ProvisionError> {
        let key = service.key();
        let running = self.registry().services.get(&service.port).cloned();

        match running {
            Some(held_by) if held_by == key => {
                debug!(service = %key, port = service.port, "Reusing running service");
            }
            Some(held_by) => {
                return Err(ProvisionError::PortConflict {
                    port: service.port,
                    held_by,
                    requested: key,
                });
            }
            None => {
                if self.backend.is_ready(service).await {
                    info!(service = %key, port = service.port, "Service already listening");
                } else {
                    info!(service = %key, port = service.port, "Starting service");
                    self.backend.start(service).await?;
                    self.registry().started.insert(service.port, service.clone());
                    self.wait_ready(service).await?;
                }
                self.registry().services.insert(service.port, key.clone());
            }
        }

        if let Some(database) = &service.database {
            let entry = (service.port, database.clone());
            if !self.registry().databases.contains(&entry) {
                info!(service = %key, database = %database, "Creating database");
                self.backend.create_database(service, database).await?;
                self.registry().databases.insert(entry);
            }
        }
        Ok(())
    }

    async fn wait_ready(&self, service: &ServiceRequirement) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + Duration::from_secs(service.ready_timeout_secs);
        loop {
            if self.backend.is_ready(service).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(service = %service.key(), port = service.port, "Service not ready");
                return Err(ProvisionError::ServiceNotReady {
                    service: service.key(),
                    port: service.port,
                    timeout_secs: service.ready_timeout_secs,
                });
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }
}

#[async_trait]
impl EnvironmentProvisioner for HostProvisioner {
    async fn provision(&self, job: &JobSpec) -> Result<ProvisionedEnvironment, ProvisionError> {
        let runtime = &job.runtime;
        let bin = self
            .locator
            .locate(&runtime.language, &runtime.version)
            .await
            .ok_or_else(|| ProvisionError::RuntimeUnavailable {
                language: runtime.language.clone(),
                version: runtime.version.clone(),
            })?;

        self.install_addons(job).await?;

        for service in &job.services {
            self.ensure_service(service).await?;
        }

        let workdir = match &job.workdir {
            Some(dir) => self.config.workspace.join(dir),
            None => self.config.workspace.clone(),
        };
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| ProvisionError::Workspace(format!("{}: {}", workdir.display(), e)))?;

        debug!(job = %job.label, runtime = %bin.display(), workdir = %workdir.display(), "Provisioned");

        Ok(ProvisionedEnvironment {
            workdir,
            path_prefix: vec![bin],
            env: job.env.clone(),
        })
    }

    async fn teardown(&self, job: &JobSpec, env: ProvisionedEnvironment) {
        debug!(job = %job.label, workdir = %env.workdir.display(), "Releasing job context");
    }

    async fn shutdown(&self) {
        let started = {
            let mut registry = self.registry();
            let started = std::mem::take(&mut registry.started);
            for port in started.keys() {
                registry.services.remove(port);
                registry.databases.retain(|(p, _)| p != port);
            }
            started
        };

        for service in started.values() {
            info!(service = %service.key(), port = service.port, "Stopping service");
            if let Err(e) = self.backend.stop(service).await {
                warn!(error = %e, "Failed to stop service");
            }
        }
    }
}
