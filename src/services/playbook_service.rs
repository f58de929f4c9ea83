//! Playbook service: the write-side entry points used by the CLI and by
//! embedding applications.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult, StepError};
use crate::domain::models::{
    HumanTask, HumanTaskStatus, PlaybookDefinition, Run, RunStatus, StepInstance, StepStatus, WorkerType,
};
use crate::domain::ports::{DefinitionRepository, HumanTaskRepository, RunFilter, RunRepository, StepRepository};
use crate::services::audit_log::{user_actor, AuditAction, AuditActor, AuditCategory, AuditEntry, AuditLevel, AuditLogService};
use crate::services::dependency_resolver::DependencyResolver;
use crate::services::orchestrator::OrchestratorDaemon;
use crate::services::retry_manager::RetryManager;
use crate::services::workers::WorkerRegistry;

/// Request to start a run.
#[derive(Debug, Clone)]
pub struct StartRun {
    pub definition_id: String,
    pub organization_id: String,
    pub input: serde_json::Value,
    pub context: Option<serde_json::Value>,
    pub requested_by: Option<String>,
}

impl StartRun {
    pub fn new(definition_id: impl Into<String>, organization_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            definition_id: definition_id.into(),
            organization_id: organization_id.into(),
            input,
            context: None,
            requested_by: None,
        }
    }

    pub fn requested_by(mut self, principal: impl Into<String>) -> Self {
        self.requested_by = Some(principal.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// A run with its step instances in sequence order.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetails {
    pub run: Run,
    pub steps: Vec<StepInstance>,
}

/// Repositories the service reads and writes.
pub struct PlaybookServiceDeps {
    pub definitions: Arc<dyn DefinitionRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub human_tasks: Arc<dyn HumanTaskRepository>,
    pub audit: Arc<AuditLogService>,
}

pub struct PlaybookService {
    definitions: Arc<dyn DefinitionRepository>,
    runs: Arc<dyn RunRepository>,
    steps: Arc<dyn StepRepository>,
    human_tasks: Arc<dyn HumanTaskRepository>,
    audit: Arc<AuditLogService>,
    registry: WorkerRegistry,
    retry: RetryManager,
    resolver: DependencyResolver,
    daemon: Option<Arc<OrchestratorDaemon>>,
}

impl PlaybookService {
    pub fn new(deps: PlaybookServiceDeps, registry: WorkerRegistry, retry: RetryManager) -> Self {
        Self {
            definitions: deps.definitions,
            runs: deps.runs,
            steps: deps.steps,
            human_tasks: deps.human_tasks,
            audit: deps.audit,
            registry,
            retry,
            resolver: DependencyResolver::new(),
            daemon: None,
        }
    }

    /// Wake this daemon whenever a run is created or a step is signalled.
    pub fn with_daemon(mut self, daemon: Arc<OrchestratorDaemon>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn registered_worker_types(&self) -> Vec<WorkerType> {
        self.registry.registered_types()
    }

    /// Check a definition without storing it.
    pub fn validate_definition(&self, definition: &PlaybookDefinition) -> DomainResult<()> {
        self.resolver.validate_graph(definition)?;
        self.registry.validate_covers(definition)
    }

    /// Validate and store a definition. Re-registering an id replaces it.
    pub async fn register_definition(&self, definition: PlaybookDefinition) -> DomainResult<PlaybookDefinition> {
        self.validate_definition(&definition)?;
        self.definitions.upsert(&definition).await?;

        tracing::info!(
            definition_id = %definition.id,
            version = definition.version,
            steps = definition.steps.len(),
            "playbook definition registered"
        );
        let mut entry = AuditEntry::new(
            AuditLevel::Info,
            AuditCategory::Definition,
            AuditAction::DefinitionRegistered,
            AuditActor::System,
            format!("Playbook '{}' v{} registered", definition.id, definition.version),
        )
        .with_metadata("definition_id", json!(definition.id));
        if let Some(org) = &definition.organization_id {
            entry = entry.with_organization(org.clone());
        }
        self.audit.log(entry).await;
        Ok(definition)
    }

    pub async fn register_definition_yaml(&self, source: &str) -> DomainResult<PlaybookDefinition> {
        self.register_definition(PlaybookDefinition::from_yaml(source)?).await
    }

    pub async fn get_definition(&self, id: &str) -> DomainResult<PlaybookDefinition> {
        self.definitions
            .get(id)
            .await?
            .ok_or_else(|| DomainError::DefinitionNotFound(id.to_string()))
    }

    pub async fn list_definitions(&self, organization_id: &str) -> DomainResult<Vec<PlaybookDefinition>> {
        self.definitions.list_for_organization(organization_id).await
    }

    /// Create a queued run and materialize one step instance per step
    /// definition.
    pub async fn start_run(&self, request: StartRun) -> DomainResult<Run> {
        if request.organization_id.trim().is_empty() {
            return Err(DomainError::ValidationFailed("organization id must not be empty".into()));
        }

        let definition = self.get_definition(&request.definition_id).await?;
        if !definition.visible_to(&request.organization_id) {
            return Err(DomainError::DefinitionNotFound(request.definition_id));
        }

        let mut run = Run::new(&definition.id, &request.organization_id, request.input);
        if let Some(context) = request.context {
            run = run.with_context(context);
        }
        if let Some(principal) = request.requested_by {
            run = run.with_requested_by(principal);
        }
        run.total_steps = definition.steps.len() as u32;

        let default_max_retries = self.retry.config().default_max_retries;
        let steps: Vec<StepInstance> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(idx, def)| {
                let step = StepInstance::new(
                    run.id,
                    &run.organization_id,
                    idx as u32 + 1,
                    &def.id,
                    def.worker.worker_type(),
                    def.depends_on.clone(),
                )
                .with_name(def.display_name())
                .with_input(def.input.clone())
                .with_max_retries(def.max_retries.unwrap_or(default_max_retries));
                if def.required {
                    step
                } else {
                    step.optional()
                }
            })
            .collect();

        self.runs.create(&run).await?;
        self.steps.create_many(&steps).await?;

        tracing::info!(
            run_id = %run.id,
            definition_id = %run.definition_id,
            organization_id = %run.organization_id,
            steps = steps.len(),
            "run created"
        );
        self.audit
            .log(
                AuditEntry::new(
                    AuditLevel::Info,
                    AuditCategory::Run,
                    AuditAction::RunCreated,
                    user_actor(run.requested_by.as_deref().unwrap_or("system")),
                    format!("Run of '{}' created", run.definition_id),
                )
                .with_organization(run.organization_id.clone())
                .with_run(run.id)
                .with_metadata("total_steps", json!(run.total_steps)),
            )
            .await;

        if let Some(daemon) = &self.daemon {
            daemon.notify_new_run(run.id);
        }
        Ok(run)
    }

    pub async fn get_run(&self, run_id: Uuid) -> DomainResult<Run> {
        self.runs.get(run_id).await?.ok_or(DomainError::RunNotFound(run_id))
    }

    pub async fn get_run_with_steps(&self, run_id: Uuid) -> DomainResult<RunDetails> {
        let run = self.get_run(run_id).await?;
        let steps = self.steps.list_for_run(run_id).await?;
        Ok(RunDetails { run, steps })
    }

    pub async fn list_runs(&self, filter: RunFilter) -> DomainResult<Vec<Run>> {
        self.runs.list(filter).await
    }

    /// Cancel a queued or in-progress run. Steps that have not started are
    /// skipped; executing handlers notice at settlement.
    pub async fn cancel_run(&self, run_id: Uuid, principal: &str) -> DomainResult<Run> {
        let mut run = self.get_run(run_id).await?;
        let previous = run.status;
        run.transition_to(RunStatus::Cancelled)?;
        run.error = Some(format!("cancelled by {principal}"));
        self.runs.update(&run).await?;

        for mut step in self.steps.list_for_run(run_id).await? {
            if step.status == StepStatus::RetryPending {
                step.transition_to(StepStatus::Pending)?;
            }
            let parked = step.status == StepStatus::InProgress && step.awaiting_signal;
            if parked || matches!(step.status, StepStatus::Pending | StepStatus::NotReady) {
                step.transition_to(StepStatus::Skipped)?;
                self.steps.update(&step).await?;
            }
        }

        tracing::info!(run_id = %run_id, principal, "run cancelled");
        self.audit
            .log(
                AuditEntry::new(
                    AuditLevel::Warning,
                    AuditCategory::Run,
                    AuditAction::RunCancelled,
                    user_actor(principal),
                    format!("Run cancelled by {principal}"),
                )
                .with_organization(run.organization_id.clone())
                .with_run(run.id)
                .with_state_change(previous.as_str(), RunStatus::Cancelled.as_str()),
            )
            .await;
        Ok(run)
    }

    pub async fn get_human_task(&self, task_id: Uuid) -> DomainResult<HumanTask> {
        self.human_tasks
            .get(task_id)
            .await?
            .ok_or(DomainError::HumanTaskNotFound(task_id))
    }

    /// Complete a human task and the step waiting on it.
    pub async fn complete_human_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
        principal: &str,
    ) -> DomainResult<StepInstance> {
        let (mut task, mut step) = self.open_task_and_step(task_id).await?;

        task.status = HumanTaskStatus::Completed;
        task.result = Some(result.clone());
        task.completed_at = Some(Utc::now());
        self.human_tasks.update(&task).await?;

        step.complete(json!({
            "task_id": task.id.to_string(),
            "assignee": task.assignee,
            "completed_by": principal,
            "result": result,
        }))?;
        self.steps.update(&step).await?;

        tracing::info!(task_id = %task_id, step_id = %step.id, principal, "human task completed");
        self.audit_task(&step, &task, principal, "completed").await;
        self.wake_daemon();
        Ok(step)
    }

    /// Reject a human task. The waiting step fails without retry.
    pub async fn reject_human_task(&self, task_id: Uuid, reason: &str, principal: &str) -> DomainResult<StepInstance> {
        let (mut task, mut step) = self.open_task_and_step(task_id).await?;

        task.status = HumanTaskStatus::Rejected;
        task.result = Some(json!({ "reason": reason }));
        task.completed_at = Some(Utc::now());
        self.human_tasks.update(&task).await?;

        let error = StepError::execution(format!("task rejected by {principal}: {reason}"));
        self.retry.apply(&mut step, &error)?;
        self.steps.update(&step).await?;

        tracing::info!(task_id = %task_id, step_id = %step.id, principal, "human task rejected");
        self.audit_task(&step, &task, principal, "rejected").await;
        self.wake_daemon();
        Ok(step)
    }

    async fn open_task_and_step(&self, task_id: Uuid) -> DomainResult<(HumanTask, StepInstance)> {
        let task = self.get_human_task(task_id).await?;
        if !task.is_open() {
            return Err(DomainError::InvalidStateTransition {
                from: task.status.as_str().to_string(),
                to: "resolved".to_string(),
                reason: format!("human task {task_id} is already resolved"),
            });
        }

        let step = self
            .steps
            .get(task.step_id)
            .await?
            .ok_or(DomainError::StepNotFound(task.step_id))?;
        if step.status != StepStatus::InProgress || !step.awaiting_signal {
            return Err(DomainError::InvalidStateTransition {
                from: step.status.as_str().to_string(),
                to: StepStatus::Completed.as_str().to_string(),
                reason: format!("step {} is not awaiting a signal", step.id),
            });
        }
        Ok((task, step))
    }

    async fn audit_task(&self, step: &StepInstance, task: &HumanTask, principal: &str, outcome: &str) {
        self.audit
            .log(
                AuditEntry::new(
                    AuditLevel::Info,
                    AuditCategory::Step,
                    AuditAction::HumanTaskResolved,
                    user_actor(principal),
                    format!("Human task {} {outcome}", task.id),
                )
                .with_step(step)
                .with_state_change(StepStatus::InProgress.as_str(), step.status.as_str())
                .with_metadata("task_id", json!(task.id.to_string())),
            )
            .await;
    }

    fn wake_daemon(&self) {
        if let Some(daemon) = &self.daemon {
            daemon.wake();
        }
    }
}
