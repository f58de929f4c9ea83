//! Command-line interface.
//!
//! A thin layer over [`Engine`]: each subcommand opens the configured
//! database, performs one operation and prints the result.

pub mod commands;
pub mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::application::Engine;
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

pub use commands::definition::DefinitionArgs;
pub use commands::run::{CancelArgs, RunsArgs, ShowArgs, SubmitArgs};
pub use commands::serve::ServeArgs;
pub use commands::task::TaskArgs;

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Conductor - playbook orchestration engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file; defaults to .conductor/config.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator daemon until interrupted
    Serve(ServeArgs),
    /// Start a run of a registered playbook
    Submit(SubmitArgs),
    /// Cancel a run
    Cancel(CancelArgs),
    /// Validate a playbook definition file without registering it
    Validate {
        /// Path to the YAML definition
        file: PathBuf,
    },
    /// Show a run with its steps
    Show(ShowArgs),
    /// List runs
    Runs(RunsArgs),
    /// Playbook definition management
    Definition(DefinitionArgs),
    /// Human task commands
    Task(TaskArgs),
}

/// Load configuration from an explicit file or the default locations.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Load configuration and open an engine against the configured database.
pub async fn open_engine(path: Option<&Path>) -> Result<Engine> {
    let config = load_config(path)?;
    Engine::open(config).await.context("Failed to open engine")
}

/// Print an error and exit with a non-zero status.
pub fn handle_error(err: anyhow::Error, json: bool) -> ! {
    if json {
        let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
        let body = serde_json::json!({ "error": err.to_string(), "causes": chain });
        eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}
