//! `cde`: inspect and edit the workflow state document.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::warn;

use cde_orchestrator::logging::init_logging;
use cde_orchestrator::{
    ConfigError, FeatureRecord, FeatureStatus, OrchestratorConfig, PersistentStateStore, Phase,
    RetryPolicy, StateError,
};

#[derive(Parser)]
#[command(name = "cde", version, about = "Workflow state for the orchestration core")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file, overriding the configured path.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Log level used when neither CDE_LOG nor RUST_LOG is set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the state document, or one feature.
    Show {
        /// Feature id.
        id: Option<String>,
    },
    /// List backup files, oldest first.
    Backups,
    /// Register a new feature in the define phase.
    Add {
        id: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "default")]
        workflow_type: String,
    },
    /// Move a feature to another phase.
    Advance {
        id: String,
        phase: String,
        /// Status to record instead of the phase's working status.
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(Some(&cli.log_level));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = OrchestratorConfig::load(cli.config.as_deref())?;
    let mut store_config = config.state_store_config();
    if let Some(path) = cli.state {
        store_config.path = path;
        store_config.backup_dir = None;
    }
    let store = PersistentStateStore::new(store_config);

    match cli.command {
        Command::Show { id } => cmd_show(&store, id.as_deref()),
        Command::Backups => cmd_backups(&store),
        Command::Add {
            id,
            prompt,
            workflow_type,
        } => cmd_add(&store, &id, &prompt, &workflow_type),
        Command::Advance { id, phase, status } => {
            let phase: Phase = phase.parse()?;
            let status = status.map(|s| s.parse::<FeatureStatus>()).transpose()?;
            cmd_advance(&store, &id, phase, status)
        }
    }
}

fn cmd_show(store: &PersistentStateStore, id: Option<&str>) -> Result<(), CliError> {
    let loaded = store.load();
    for diagnostic in &loaded.diagnostics {
        warn!("{}", diagnostic);
    }

    let rendered = match id {
        Some(id) => {
            let record = loaded
                .document
                .feature(id)
                .ok_or_else(|| StateError::FeatureNotFound(id.to_string()))?;
            serde_json::to_string_pretty(record)?
        }
        None => serde_json::to_string_pretty(&loaded.document)?,
    };
    println!("{}", rendered);
    Ok(())
}

fn cmd_backups(store: &PersistentStateStore) -> Result<(), CliError> {
    for path in store.list_backups()? {
        println!("{}", path.display());
    }
    Ok(())
}

fn cmd_add(
    store: &PersistentStateStore,
    id: &str,
    prompt: &str,
    workflow_type: &str,
) -> Result<(), CliError> {
    RetryPolicy::fs().run_blocking(|| {
        store.insert_feature(id, FeatureRecord::new(prompt).with_workflow_type(workflow_type))
    })?;
    println!("added {}", id);
    Ok(())
}

fn cmd_advance(
    store: &PersistentStateStore,
    id: &str,
    phase: Phase,
    status: Option<FeatureStatus>,
) -> Result<(), CliError> {
    let written = RetryPolicy::fs().run_blocking(|| {
        store.update(|document| {
            let record = document
                .feature_mut(id)
                .ok_or_else(|| StateError::FeatureNotFound(id.to_string()))?;
            record.advance(phase, status);
            Ok(())
        })
    })?;

    if let Some(record) = written.feature(id) {
        println!("{} -> {} ({})", id, record.current_phase, record.status);
    }
    Ok(())
}
