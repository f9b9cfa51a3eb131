//! Host provisioning and shell execution for Trellis jobs.

pub mod process;
pub mod provisioner;
pub mod runner;
pub mod shell;

pub use process::{ProcessGroup, ProcessGroups};
pub use provisioner::{
    CommandServiceBackend, HostProvisioner, ProvisionerConfig, RuntimeLocator, ServiceBackend,
    ToolcacheLocator,
};
pub use runner::{DEFAULT_INHERITED_ENV, RunnerConfig};
pub use shell::ShellRunner;
