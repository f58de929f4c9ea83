//! Human task commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

use crate::cli::open_engine;
use crate::cli::output::{output, step_line, CommandOutput};
use crate::domain::models::{HumanTask, StepInstance};

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommand,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Show a human task
    Show {
        task_id: Uuid,
    },
    /// Complete a human task; its step completes with the given result
    Complete {
        task_id: Uuid,

        /// Result as JSON
        #[arg(short, long, default_value = "{}")]
        result: String,

        /// Principal completing the task
        #[arg(short = 'u', long, default_value = "cli")]
        principal: String,
    },
    /// Reject a human task; its step fails without retry
    Reject {
        task_id: Uuid,

        #[arg(short, long)]
        reason: String,

        /// Principal rejecting the task
        #[arg(short = 'u', long, default_value = "cli")]
        principal: String,
    },
}

#[derive(Serialize)]
struct TaskOutput {
    task: HumanTask,
}

impl CommandOutput for TaskOutput {
    fn to_human(&self) -> String {
        let task = &self.task;
        let mut lines = vec![
            format!("Task {}", task.id),
            format!("  Title: {}", task.title),
            format!("  Status: {}", task.status.as_str()),
            format!("  Run: {}", task.run_id),
            format!("  Step: {}", task.step_id),
        ];
        if let Some(assignee) = &task.assignee {
            lines.push(format!("  Assignee: {assignee}"));
        }
        if let Some(due_at) = task.due_at {
            lines.push(format!("  Due at: {}", due_at.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if let Some(description) = &task.description {
            lines.push(format!("  Description: {description}"));
        }
        lines.join("\n")
    }
}

#[derive(Serialize)]
struct SettledStep {
    step: StepInstance,
}

impl CommandOutput for SettledStep {
    fn to_human(&self) -> String {
        format!("Step settled:\n{}", step_line(&self.step))
    }
}

pub async fn execute(args: TaskArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let engine = open_engine(config_path).await?;
    match args.command {
        TaskCommand::Show { task_id } => {
            let task = engine.playbooks.get_human_task(task_id).await?;
            output(&TaskOutput { task }, json_mode);
        }
        TaskCommand::Complete {
            task_id,
            result,
            principal,
        } => {
            let result: serde_json::Value = serde_json::from_str(&result).context("Task result is not valid JSON")?;
            let step = engine
                .playbooks
                .complete_human_task(task_id, result, &principal)
                .await
                .with_context(|| format!("Failed to complete task {task_id}"))?;
            output(&SettledStep { step }, json_mode);
        }
        TaskCommand::Reject {
            task_id,
            reason,
            principal,
        } => {
            let step = engine
                .playbooks
                .reject_human_task(task_id, &reason, &principal)
                .await
                .with_context(|| format!("Failed to reject task {task_id}"))?;
            output(&SettledStep { step }, json_mode);
        }
    }
    Ok(())
}
