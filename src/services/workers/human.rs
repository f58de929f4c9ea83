//! Human worker: creates a task for a person and returns immediately.
//!
//! The step stays `in_progress` with `awaiting_signal` set until the task is
//! completed or rejected through the playbook service.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::errors::StepError;
use crate::domain::models::{
    AssignmentCandidate, AssignmentStrategy, ExecutionOptions, HumanStepConfig, HumanTask, StepDescriptor,
    UpstreamContext, WorkerInfo, WorkerOutput, WorkerSpec, WorkerType,
};
use crate::domain::ports::{HumanTaskRepository, Notification, Notifier, WorkerHandler};
use crate::services::workers::mapping::render_template;

/// Channel used for assignment notifications.
pub const ASSIGNMENT_CHANNEL: &str = "in_app";

pub struct HumanWorker {
    tasks: Arc<dyn HumanTaskRepository>,
    notifier: Arc<dyn Notifier>,
    /// Next round-robin position per (organization, step definition)
    rotation: Mutex<HashMap<(String, String), usize>>,
}

/// Candidates holding every required skill, best overlap first.
fn skill_matches<'a>(candidates: &'a [AssignmentCandidate], required: &[String]) -> Vec<&'a AssignmentCandidate> {
    let mut matching: Vec<&AssignmentCandidate> = candidates
        .iter()
        .filter(|c| required.iter().all(|skill| c.skills.contains(skill)))
        .collect();
    // Stable sort keeps declaration order among equals
    matching.sort_by_key(|c| std::cmp::Reverse(c.skills.iter().filter(|s| required.contains(s)).count()));
    matching
}

impl HumanWorker {
    pub fn new(tasks: Arc<dyn HumanTaskRepository>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            tasks,
            notifier,
            rotation: Mutex::new(HashMap::new()),
        }
    }

    fn next_in_rotation(&self, step: &StepDescriptor, len: usize) -> usize {
        let mut rotation = self.rotation.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = rotation
            .entry((step.organization_id.clone(), step.step_definition_id.clone()))
            .or_insert(0);
        let idx = *slot % len;
        *slot = slot.wrapping_add(1);
        idx
    }

    async fn assign(
        &self,
        step: &StepDescriptor,
        config: &HumanStepConfig,
        scope: &serde_json::Value,
    ) -> Result<Option<String>, StepError> {
        if let Some(assignee) = &config.assignee {
            return render_template(assignee, scope).map(Some);
        }
        if config.candidates.is_empty() {
            return Ok(None);
        }

        match config.strategy {
            None => Ok(None),
            Some(AssignmentStrategy::RoundRobin) => {
                let idx = self.next_in_rotation(step, config.candidates.len());
                Ok(Some(config.candidates[idx].user.clone()))
            }
            Some(AssignmentStrategy::SkillMatching) => {
                let matches = skill_matches(&config.candidates, &config.required_skills);
                if matches.is_empty() {
                    tracing::warn!(
                        run_id = %step.run_id,
                        step_id = %step.step_id,
                        required_skills = ?config.required_skills,
                        "no candidate has the required skills; leaving task unassigned"
                    );
                }
                Ok(matches.first().map(|c| c.user.clone()))
            }
            Some(AssignmentStrategy::WorkloadBalancing) => {
                let mut best: Option<(&str, u64)> = None;
                for candidate in &config.candidates {
                    let open = self
                        .tasks
                        .count_open_for(&step.organization_id, &candidate.user)
                        .await?;
                    if best.map_or(true, |(_, lowest)| open < lowest) {
                        best = Some((candidate.user.as_str(), open));
                    }
                }
                Ok(best.map(|(user, _)| user.to_string()))
            }
        }
    }
}

#[async_trait]
impl WorkerHandler for HumanWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Human
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        upstream: &UpstreamContext,
        _options: &ExecutionOptions,
    ) -> Result<WorkerOutput, StepError> {
        let WorkerSpec::Human(config) = &step.worker else {
            return Err(StepError::Validation(format!(
                "human worker cannot execute {} step '{}'",
                step.worker_type(),
                step.name
            )));
        };

        // A retried attempt reuses the task it already created
        if let Some(existing) = self.tasks.find_for_step(step.step_id).await? {
            if existing.is_open() {
                return Ok(task_created(&existing));
            }
        }

        let scope = upstream.scope(step);
        let title = render_template(&config.title, &scope).unwrap_or_else(|_| config.title.clone());
        let description = config
            .description
            .as_ref()
            .map(|d| render_template(d, &scope).unwrap_or_else(|_| d.clone()));

        let mut task = HumanTask::new(step.run_id, step.step_id, step.organization_id.clone(), title);
        task.description = description;
        task.assignee = self.assign(step, config, &scope).await?;
        task.due_at = config
            .due_in_hours
            .map(|hours| Utc::now() + chrono::Duration::hours(i64::from(hours)));
        self.tasks.create(&task).await?;

        tracing::info!(
            run_id = %step.run_id,
            step_id = %step.step_id,
            task_id = %task.id,
            assignee = task.assignee.as_deref().unwrap_or("unassigned"),
            "human task created"
        );

        if let (true, Some(assignee)) = (config.notify, task.assignee.as_ref()) {
            let notification = Notification {
                organization_id: step.organization_id.clone(),
                channel: ASSIGNMENT_CHANNEL.to_string(),
                recipients: vec![assignee.clone()],
                subject: format!("Task assigned: {}", task.title),
                body: task.description.clone().unwrap_or_default(),
            };
            // Notification failures do not undo the assignment
            if let Err(e) = self.notifier.send(&notification).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to notify assignee");
            }
        }

        Ok(task_created(&task))
    }
}

fn task_created(task: &HumanTask) -> WorkerOutput {
    WorkerOutput::awaiting(
        json!({
            "status": "task_created",
            "task_id": task.id.to_string(),
            "assignee": task.assignee,
            "due_at": task.due_at,
        }),
        task.id.to_string(),
    )
    .with_worker_info(WorkerInfo {
        handler: "human".to_string(),
        target: task.assignee.clone(),
        attempts: 1,
        status_code: None,
    })
}
