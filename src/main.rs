//! Export agent
//!
//! Main entry point for the export-agent CLI.

use clap::Parser;
use export_agent::checkpoint::SqliteCheckpointStore;
use export_agent::commands::{Cli, Commands};
use export_agent::config::AgentConfig;
use export_agent::pipeline::JsonlSink;
use export_agent::service::{subprocess_host, ServiceRunner};
use export_agent::session::{ExportSession, OnboardOutput, SessionCommand, ValidateOutput};
use export_agent::signals::shutdown_channel;
use export_agent::supervisor::{ProcessLauncher, Supervisor};
use export_agent::{AgentError, Result};
use serde::Serialize;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() {
    let cli = Cli::parse();

    if let Err(e) = export_agent::logging::init(cli.effective_log_format()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            if cli.command.is_machine_parsed() {
                print_error(&e);
            } else {
                eprintln!("Error: {}", e);
            }
            process::exit(e.exit_code());
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    if let Commands::Version = cli.command {
        println!("export-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let root = cli.root();

    let result = run_command(cli, &runtime, &root);
    // Blocking work left behind by a timeout must not hold up the exit
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

fn run_command(cli: &Cli, runtime: &tokio::runtime::Runtime, root: &Path) -> Result<i32> {
    match &cli.command {
        Commands::Export {
            reprocess_historical,
        } => {
            let config = cli.load_config()?;
            runtime.block_on(handle_export(root, config, *reprocess_historical))
        }
        Commands::ValidateConfig => runtime.block_on(handle_validate_config(cli, root)),
        Commands::ExportOnboardData { object_type } => {
            runtime.block_on(handle_onboard(cli, root, object_type))
        }
        Commands::ServiceRun | Commands::ServiceRunInternal => {
            runtime.block_on(handle_service_run(cli, root))
        }
        Commands::ServiceRunNoRestarts => {
            let config = cli.load_config()?;
            runtime.block_on(async {
                ServiceRunner::open(root, config)?.run_with_signals().await?;
                Ok(0)
            })
        }
        Commands::Version => Ok(0),
    }
}

fn session(command: SessionCommand, root: &Path, config: &AgentConfig) -> Result<ExportSession> {
    let checkpoints = SqliteCheckpointStore::open_in(root)?;
    Ok(ExportSession::new(
        command,
        config.clone(),
        subprocess_host(config, root),
        Arc::new(checkpoints),
        Arc::new(JsonlSink::new(root)),
    ))
}

async fn handle_export(root: &Path, config: AgentConfig, reprocess_historical: bool) -> Result<i32> {
    let mut session = session(SessionCommand::Export, root, &config)?
        .with_reprocess_historical(reprocess_historical)
        .with_stop(shutdown_channel()?);
    session.setup(config.integrations.clone())?;

    let report = session.run_export().await?;
    print_json(&report)?;
    Ok(if report.is_success() { 0 } else { 1 })
}

async fn handle_validate_config(cli: &Cli, root: &Path) -> Result<i32> {
    let output = match validate_config(cli, root).await {
        Ok(output) => output,
        Err(e) => ValidateOutput::failed(&e),
    };
    print_json(&output)?;
    Ok(if output.success { 0 } else { 1 })
}

async fn validate_config(cli: &Cli, root: &Path) -> Result<ValidateOutput> {
    let config = cli.load_config()?;
    let mut session = session(SessionCommand::ValidateConfig, root, &config)?;
    session.setup(config.integrations.clone())?;
    session.run_validate_config().await
}

async fn handle_onboard(cli: &Cli, root: &Path, object_type: &str) -> Result<i32> {
    let output = match onboard(cli, root, object_type).await {
        Ok(output) => output,
        Err(e) => {
            print_json(&OnboardOutput::failed(&e))?;
            return Ok(e.exit_code());
        }
    };
    print_json(&output)?;
    Ok(if output.is_success() { 0 } else { 1 })
}

async fn onboard(cli: &Cli, root: &Path, object_type: &str) -> Result<OnboardOutput> {
    let config = cli.load_config()?;
    let mut session = session(SessionCommand::OnboardExport, root, &config)?;
    session.setup(config.integrations.clone())?;
    session.run_onboard_export(object_type).await
}

async fn handle_service_run(cli: &Cli, root: &Path) -> Result<i32> {
    let config = cli.load_config()?;

    let mut launcher = ProcessLauncher::current_exe(root)?;
    if let Some(dir) = &cli.integrations_dir {
        launcher = launcher.arg("--integrations-dir").arg(dir);
    }
    if let Some(json) = &cli.integrations_json {
        launcher = launcher.arg("--integrations-json").arg(json);
    }

    let mut supervisor = Supervisor::new(Arc::new(launcher), &config.supervisor);
    let outcome = supervisor.run_with_signals().await?;
    tracing::info!(
        outcome = ?outcome,
        restarts = supervisor.state().restart_count,
        "Supervisor exiting"
    );
    Ok(outcome.exit_code())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_error(err: &AgentError) {
    let payload = serde_json::json!({ "error": err.to_string() });
    println!("{}", payload);
}
