//! Run commands: submit, cancel, show and list.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

use crate::cli::open_engine;
use crate::cli::output::{output, run_line, step_line, CommandOutput};
use crate::domain::models::{Run, RunStatus};
use crate::domain::ports::RunFilter;
use crate::services::{RunDetails, StartRun};

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Playbook definition id
    pub definition_id: String,

    /// Organization the run belongs to
    #[arg(short, long)]
    pub org: String,

    /// Run input as a JSON object
    #[arg(short, long)]
    pub input: Option<String>,

    /// Principal whose permissions gate the steps
    #[arg(short = 'u', long)]
    pub requested_by: Option<String>,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    pub run_id: Uuid,

    /// Principal recorded as cancelling the run
    #[arg(short = 'u', long, default_value = "cli")]
    pub principal: String,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub run_id: Uuid,
}

#[derive(Args, Debug)]
pub struct RunsArgs {
    /// Filter by status (queued, in_progress, completed, failed, cancelled)
    #[arg(short, long)]
    pub status: Option<String>,

    /// Filter by organization
    #[arg(short, long)]
    pub org: Option<String>,

    /// Filter by playbook definition
    #[arg(short, long)]
    pub definition: Option<String>,

    /// Maximum number of runs to display
    #[arg(short, long, default_value = "50")]
    pub limit: i64,
}

#[derive(Serialize)]
struct RunOutput {
    run: Run,
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        format!(
            "Run {} ({}) is {}.",
            self.run.id,
            self.run.definition_id,
            self.run.status.as_str()
        )
    }
}

#[derive(Serialize)]
struct RunDetailsOutput {
    #[serde(flatten)]
    details: RunDetails,
}

impl CommandOutput for RunDetailsOutput {
    fn to_human(&self) -> String {
        let run = &self.details.run;
        let mut lines = vec![
            format!("Run {}", run.id),
            format!("  Playbook: {}", run.definition_id),
            format!("  Organization: {}", run.organization_id),
            format!("  Status: {}", run.status.as_str()),
            format!("  Progress: step {}/{}", run.current_step.min(run.total_steps), run.total_steps),
            format!("  Created at: {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
        ];
        if let Some(completed_at) = run.completed_at {
            lines.push(format!("  Completed at: {}", completed_at.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if let Some(error) = &run.error {
            lines.push(format!("  Error: {error}"));
        }
        lines.push("Steps:".to_string());
        lines.extend(self.details.steps.iter().map(step_line));
        lines.join("\n")
    }
}

#[derive(Serialize)]
struct RunListOutput {
    runs: Vec<Run>,
}

impl CommandOutput for RunListOutput {
    fn to_human(&self) -> String {
        if self.runs.is_empty() {
            return "No runs found.".to_string();
        }
        let mut lines: Vec<String> = self.runs.iter().map(run_line).collect();
        lines.push(format!("\nShowing {} run(s)", self.runs.len()));
        lines.join("\n")
    }
}

fn parse_input(raw: Option<&str>) -> Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::json!({})),
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw).context("Run input is not valid JSON")?;
            anyhow::ensure!(value.is_object(), "Run input must be a JSON object");
            Ok(value)
        }
    }
}

pub async fn submit(args: SubmitArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let input = parse_input(args.input.as_deref())?;
    let engine = open_engine(config_path).await?;

    let mut request = StartRun::new(args.definition_id, args.org, input);
    if let Some(principal) = args.requested_by {
        request = request.requested_by(principal);
    }
    let run = engine.playbooks.start_run(request).await.context("Failed to start run")?;

    output(&RunOutput { run }, json_mode);
    Ok(())
}

pub async fn cancel(args: CancelArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let engine = open_engine(config_path).await?;
    let run = engine
        .playbooks
        .cancel_run(args.run_id, &args.principal)
        .await
        .with_context(|| format!("Failed to cancel run {}", args.run_id))?;

    output(&RunOutput { run }, json_mode);
    Ok(())
}

pub async fn show(args: ShowArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let engine = open_engine(config_path).await?;
    let details = engine
        .playbooks
        .get_run_with_steps(args.run_id)
        .await
        .with_context(|| format!("Run {} not found. Use 'conductor runs' to list runs.", args.run_id))?;

    output(&RunDetailsOutput { details }, json_mode);
    Ok(())
}

pub async fn list(args: RunsArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let statuses = match args.status.as_deref() {
        Some(raw) => vec![RunStatus::from_str(raw).ok_or_else(|| anyhow::anyhow!("Unknown run status '{raw}'"))?],
        None => Vec::new(),
    };
    let filter = RunFilter {
        statuses,
        organizations: args.org.into_iter().collect(),
        definition_id: args.definition,
        limit: Some(args.limit),
    };

    let engine = open_engine(config_path).await?;
    let runs = engine.playbooks.list_runs(filter).await.context("Failed to list runs")?;

    output(&RunListOutput { runs }, json_mode);
    Ok(())
}
