//! Trellis CLI entrypoint.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use trellis_core::DefinitionError;

mod commands;
mod config;
mod handlers;
mod report;


use commands::{Commands, ConfigCommands};
use config::CliConfig;

/// Exit code for definitions that cannot be loaded or expanded.
const EXIT_DEFINITION_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "trellis")]
#[command(author, version, about = "Trellis CI matrix runner", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn,trellis=info",
        1 => "info,trellis=debug",
        _ => "debug,trellis=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(command: Commands, config: &CliConfig) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Run(args) => handlers::run(config, args).await,
        Commands::DeployCheck { definition, branch } => {
            handlers::deploy_check(&definition, branch).await
        }
        Commands::Validate { definition } => handlers::validate(&definition),
        Commands::Schema => handlers::schema(),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(config),
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value),
        },
    }
}

fn error_exit_status(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<DefinitionError>().is_some() {
        EXIT_DEFINITION_ERROR
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = CliConfig::load().unwrap_or_default();

    match dispatch(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("✗").red().bold(), e);
            ExitCode::from(error_exit_status(&e))
        }
    }
}
