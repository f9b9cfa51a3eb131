//! CLI command definitions.

use crate::config::OutputFormat;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run every job of a matrix definition
    Run(RunArgs),

    /// Check whether the deploy step would run, assuming a green build
    DeployCheck {
        /// Path to the matrix definition
        #[arg(default_value = "trellis.yaml")]
        definition: PathBuf,

        /// Branch being built
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Validate a matrix definition and list its jobs
    Validate {
        /// Path to the matrix definition
        #[arg(default_value = "trellis.yaml")]
        definition: PathBuf,
    },

    /// Print the JSON schema of matrix definitions
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the matrix definition
    #[arg(default_value = "trellis.yaml")]
    pub definition: PathBuf,

    /// Run a single job, by index or label
    #[arg(long)]
    pub only: Option<String>,

    /// Branch being built
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Maximum number of jobs running at once
    #[arg(short = 'j', long)]
    pub max_parallel: Option<usize>,

    /// Per-job wall-clock timeout, overriding the definition
    #[arg(long)]
    pub timeout_minutes: Option<u32>,

    /// Workspace root for job working directories
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Never run the deploy step
    #[arg(long)]
    pub no_deploy: bool,

    /// Report format
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
