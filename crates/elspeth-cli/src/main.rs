// elspeth-cli/src/main.rs
// ============================================================================
// Module: ELSPETH Binary
// Description: Thin argument-parsing shell over the CLI library.
// Purpose: Map commands to library calls and library errors to exit codes.
// Dependencies: clap, elspeth-cli, tokio, tracing-subscriber
// ============================================================================

//! ## Overview
//! The binary parses arguments, installs the tracing subscriber, and
//! dispatches to the library commands. Exit codes: 0 success, 1
//! configuration error, 2 runtime failure, 3 incompatible checkpoint.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use elspeth_cli::CliError;
use elspeth_cli::CommandOutcome;
use elspeth_cli::EmptyRegistry;
use elspeth_config::Settings;
use elspeth_core::RunId;
use elspeth_core::RunMode;

// ============================================================================
// SECTION: Arguments
// ============================================================================

/// ELSPETH: audited data pipeline execution.
#[derive(Debug, Parser)]
#[command(name = "elspeth", version)]
struct Cli {
    /// Command to run.
    #[command(subcommand)]
    command: Command,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Validates settings and reports graph shape.
    Validate {
        /// Settings file path.
        #[arg(long, default_value = "elspeth.yaml")]
        settings: PathBuf,
    },
    /// Executes the pipeline live.
    Run {
        /// Settings file path.
        #[arg(long, default_value = "elspeth.yaml")]
        settings: PathBuf,
    },
    /// Resumes an interrupted run from its latest checkpoint.
    Resume {
        /// Settings file path.
        #[arg(long, default_value = "elspeth.yaml")]
        settings: PathBuf,
        /// Run to resume.
        #[arg(long)]
        run_id: String,
    },
    /// Re-executes a pipeline from recorded external calls.
    Replay {
        /// Settings file path.
        #[arg(long, default_value = "elspeth.yaml")]
        settings: PathBuf,
        /// Recorded run to replay against.
        #[arg(long)]
        source_run_id: String,
    },
    /// Re-executes live and compares against recorded calls.
    Verify {
        /// Settings file path.
        #[arg(long, default_value = "elspeth.yaml")]
        settings: PathBuf,
        /// Recorded run to verify against.
        #[arg(long)]
        source_run_id: String,
    },
    /// Landscape maintenance.
    Landscape {
        /// Landscape subcommand.
        #[command(subcommand)]
        command: LandscapeCommand,
    },
}

/// Landscape maintenance subcommands.
#[derive(Debug, Subcommand)]
enum LandscapeCommand {
    /// Creates the schema on empty databases; guards existing ones.
    Migrate {
        /// Settings file path.
        #[arg(long, default_value = "elspeth.yaml")]
        settings: PathBuf,
    },
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// Prints a command outcome for the operator.
#[allow(
    clippy::print_stdout,
    reason = "The binary is the single user-facing output surface."
)]
fn report(outcome: &CommandOutcome) {
    for line in &outcome.lines {
        println!("{line}");
    }
}

/// Prints a command failure for the operator.
#[allow(
    clippy::print_stderr,
    reason = "The binary is the single user-facing output surface."
)]
fn report_error(error: &CliError) {
    eprintln!("error: {error}");
}

/// Loads settings or maps the failure to a configuration error.
fn load_settings(path: &PathBuf) -> Result<Settings, CliError> {
    Settings::load(path).map_err(|err| CliError::Config(err.to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = EmptyRegistry;
    let result: Result<CommandOutcome, CliError> = match cli.command {
        Command::Validate { settings } => {
            load_settings(&settings).and_then(|loaded| elspeth_cli::cmd_validate(&loaded, &registry))
        }
        Command::Run { settings } => match load_settings(&settings) {
            Ok(loaded) => elspeth_cli::cmd_run(&loaded, &registry, RunMode::Live, None).await,
            Err(error) => Err(error),
        },
        Command::Resume { settings, run_id } => match load_settings(&settings) {
            Ok(loaded) => {
                elspeth_cli::cmd_resume(&loaded, &registry, &RunId::new(run_id)).await
            }
            Err(error) => Err(error),
        },
        Command::Replay { settings, source_run_id } => match load_settings(&settings) {
            Ok(loaded) => {
                elspeth_cli::cmd_run(
                    &loaded,
                    &registry,
                    RunMode::Replay,
                    Some(RunId::new(source_run_id)),
                )
                .await
            }
            Err(error) => Err(error),
        },
        Command::Verify { settings, source_run_id } => match load_settings(&settings) {
            Ok(loaded) => {
                elspeth_cli::cmd_run(
                    &loaded,
                    &registry,
                    RunMode::Verify,
                    Some(RunId::new(source_run_id)),
                )
                .await
            }
            Err(error) => Err(error),
        },
        Command::Landscape { command } => match command {
            LandscapeCommand::Migrate { settings } => {
                load_settings(&settings).and_then(|loaded| elspeth_cli::cmd_migrate(&loaded))
            }
        },
    };

    match result {
        Ok(outcome) => {
            report(&outcome);
            ExitCode::from(elspeth_cli::EXIT_OK)
        }
        Err(error) => {
            report_error(&error);
            ExitCode::from(error.exit_code())
        }
    }
}
