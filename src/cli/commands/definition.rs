//! Playbook definition commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::application::Engine;
use crate::cli::output::{output, CommandOutput};
use crate::cli::{load_config, open_engine};
use crate::domain::models::PlaybookDefinition;

#[derive(Args, Debug)]
pub struct DefinitionArgs {
    #[command(subcommand)]
    pub command: DefinitionCommand,
}

#[derive(Subcommand, Debug)]
pub enum DefinitionCommand {
    /// Validate and store a definition from a YAML file
    Register {
        file: PathBuf,
    },
    /// List definitions visible to an organization
    List {
        #[arg(short, long)]
        org: String,
    },
    /// Show a stored definition
    Show {
        id: String,
    },
}

#[derive(Serialize)]
struct DefinitionSummary {
    id: String,
    name: String,
    version: u32,
    organization_id: Option<String>,
    steps: usize,
}

impl From<&PlaybookDefinition> for DefinitionSummary {
    fn from(definition: &PlaybookDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            version: definition.version,
            organization_id: definition.organization_id.clone(),
            steps: definition.steps.len(),
        }
    }
}

impl CommandOutput for DefinitionSummary {
    fn to_human(&self) -> String {
        format!(
            "{} v{} \"{}\" ({} step(s), {})",
            self.id,
            self.version,
            self.name,
            self.steps,
            self.organization_id.as_deref().unwrap_or("global")
        )
    }
}

#[derive(Serialize)]
struct ValidationOutput {
    valid: bool,
    definition: DefinitionSummary,
}

impl CommandOutput for ValidationOutput {
    fn to_human(&self) -> String {
        format!("Definition is valid: {}", self.definition.to_human())
    }
}

#[derive(Serialize)]
struct DefinitionList {
    definitions: Vec<DefinitionSummary>,
}

impl CommandOutput for DefinitionList {
    fn to_human(&self) -> String {
        if self.definitions.is_empty() {
            return "No definitions found.".to_string();
        }
        self.definitions
            .iter()
            .map(CommandOutput::to_human)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Serialize)]
struct DefinitionDetail {
    definition: PlaybookDefinition,
}

impl CommandOutput for DefinitionDetail {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.definition).unwrap_or_else(|e| format!("<unprintable definition: {e}>"))
    }
}

fn read_definition(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

/// Validate a definition against the workers the engine registers, without
/// storing it.
pub async fn validate(file: PathBuf, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let source = read_definition(&file)?;
    let definition = PlaybookDefinition::from_yaml(&source)?;

    let config = load_config(config_path)?;
    let pool = crate::adapters::sqlite::initialize_in_memory()
        .await
        .context("Failed to create scratch database")?;
    let engine = Engine::builder(config).build(pool)?;
    engine
        .playbooks
        .validate_definition(&definition)
        .with_context(|| format!("{} is not a valid playbook", file.display()))?;

    output(
        &ValidationOutput {
            valid: true,
            definition: DefinitionSummary::from(&definition),
        },
        json_mode,
    );
    Ok(())
}

pub async fn execute(args: DefinitionArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let engine = open_engine(config_path).await?;
    match args.command {
        DefinitionCommand::Register { file } => {
            let source = read_definition(&file)?;
            let definition = engine
                .playbooks
                .register_definition_yaml(&source)
                .await
                .context("Failed to register definition")?;
            output(&DefinitionSummary::from(&definition), json_mode);
        }
        DefinitionCommand::List { org } => {
            let definitions = engine.playbooks.list_definitions(&org).await?;
            output(
                &DefinitionList {
                    definitions: definitions.iter().map(DefinitionSummary::from).collect(),
                },
                json_mode,
            );
        }
        DefinitionCommand::Show { id } => {
            let definition = engine.playbooks.get_definition(&id).await?;
            output(&DefinitionDetail { definition }, json_mode);
        }
    }
    Ok(())
}
