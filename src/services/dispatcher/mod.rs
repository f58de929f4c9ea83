//! Step dispatcher.
//!
//! Takes ready steps of an active run, leases and authorizes them, and runs
//! their handlers as independent tasks. Each task settles its own step: the
//! output is persisted, or the error goes through the retry manager.

pub mod claims;

pub use claims::{ClaimGuard, ClaimSet};

use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainResult, ErrorClass, StepError};
use crate::domain::models::{
    DependencyKind, ExecutionOptions, ExecutionReport, OrchestratorConfig, PlaybookDefinition, Run, StepDefinition,
    StepDescriptor, StepInstance, StepStatus, UpstreamContext, WorkerOutput,
};
use crate::domain::ports::{RunRepository, StepRepository, WorkerHandler};
use crate::services::audit_log::{
    daemon_actor, user_actor, AuditAction, AuditActor, AuditCategory, AuditEntry, AuditLevel, AuditLogService,
};
use crate::services::idempotency_guard::{IdempotencyGuard, EXECUTE_STEP_OPERATION};
use crate::services::retry_manager::RetryManager;
use crate::services::security_gate::SecurityGate;
use crate::services::workers::mapping::resolve_path;
use crate::services::workers::WorkerRegistry;

/// Whether every conditional dependency of `step` holds against its
/// predecessor's output. A predecessor without output fails the condition.
pub fn conditions_hold(step: &StepInstance, siblings: &[StepInstance]) -> bool {
    step.dependencies
        .iter()
        .filter(|dep| dep.kind == DependencyKind::Conditional)
        .filter_map(|dep| dep.condition.as_ref().map(|c| (dep.step_number, c)))
        .all(|(sequence, condition)| {
            siblings
                .iter()
                .find(|s| s.sequence == sequence)
                .and_then(|s| s.output_data.as_ref())
                .and_then(|output| resolve_path(output, &condition.path))
                .is_some_and(|value| *value == condition.equals)
        })
}

/// Outputs of completed steps preceding `step`, keyed by sequence.
pub fn upstream_context(run: &Run, step: &StepInstance, siblings: &[StepInstance]) -> UpstreamContext {
    let step_outputs: BTreeMap<u32, (String, serde_json::Value)> = siblings
        .iter()
        .filter(|s| s.sequence < step.sequence && s.status == StepStatus::Completed)
        .filter_map(|s| {
            s.output_data
                .as_ref()
                .map(|out| (s.sequence, (s.step_definition_id.clone(), out.clone())))
        })
        .collect();

    UpstreamContext {
        run_input: run.input.clone(),
        run_context: run.context.clone(),
        step_outputs,
    }
}

/// Shared state of every handler task.
struct DispatchContext {
    instance_id: String,
    config: OrchestratorConfig,
    service_principal: String,
    claims: Arc<ClaimSet>,
    runs: Arc<dyn RunRepository>,
    steps: Arc<dyn StepRepository>,
    registry: WorkerRegistry,
    gate: Arc<SecurityGate>,
    idempotency: Arc<IdempotencyGuard>,
    retry: RetryManager,
    audit: Arc<AuditLogService>,
    wake: Arc<Notify>,
}

/// Launches and settles step executions for one coordinator instance.
#[derive(Clone)]
pub struct StepDispatcher {
    ctx: Arc<DispatchContext>,
}

/// Dependencies of a [`StepDispatcher`].
pub struct DispatcherDeps {
    pub runs: Arc<dyn RunRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub registry: WorkerRegistry,
    pub gate: Arc<SecurityGate>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub retry: RetryManager,
    pub audit: Arc<AuditLogService>,
}

impl StepDispatcher {
    pub fn new(
        instance_id: impl Into<String>,
        config: OrchestratorConfig,
        service_principal: impl Into<String>,
        deps: DispatcherDeps,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            ctx: Arc::new(DispatchContext {
                instance_id: instance_id.into(),
                config,
                service_principal: service_principal.into(),
                claims: ClaimSet::new(),
                runs: deps.runs,
                steps: deps.steps,
                registry: deps.registry,
                gate: deps.gate,
                idempotency: deps.idempotency,
                retry: deps.retry,
                audit: deps.audit,
                wake,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    pub fn claims(&self) -> &Arc<ClaimSet> {
        &self.ctx.claims
    }

    /// Drop idle per-principal rate-limit state.
    pub fn prune_rate_limits(&self) -> usize {
        self.ctx.gate.retain_recent()
    }

    /// Steps of `run` currently executing: local claims plus in-progress
    /// steps leased by other coordinators.
    pub fn in_flight_for(&self, run_id: Uuid, steps: &[StepInstance]) -> usize {
        let remote = steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress && !s.awaiting_signal)
            .filter(|s| !self.ctx.claims.contains(s.id))
            .count();
        remote + self.ctx.claims.count_for_run(run_id)
    }

    /// Dispatch pending steps of an in-progress run, up to the per-run cap.
    /// Returns the number of handler tasks launched.
    pub async fn dispatch_ready(
        &self,
        run: &Run,
        definition: &PlaybookDefinition,
        steps: &mut [StepInstance],
    ) -> DomainResult<usize> {
        let cap = self.ctx.config.max_concurrent_steps_per_run;
        let mut launched = 0;

        let pending: Vec<usize> = (0..steps.len())
            .filter(|i| steps[*i].status == StepStatus::Pending)
            .collect();

        for idx in pending {
            if self.in_flight_for(run.id, steps) >= cap {
                tracing::debug!(run_id = %run.id, cap, "per-run concurrency cap reached");
                break;
            }

            if !conditions_hold(&steps[idx], steps) {
                self.skip_for_condition(&mut steps[idx]).await?;
                continue;
            }

            let Some(claim) = self.ctx.claims.try_claim(steps[idx].id, run.id) else {
                continue;
            };

            let snapshot: Vec<StepInstance> = steps.to_vec();
            if let Some(step) = self.launch(run, definition, &steps[idx], &snapshot, claim).await? {
                steps[idx] = step;
                launched += 1;
            }
        }

        Ok(launched)
    }

    async fn skip_for_condition(&self, step: &mut StepInstance) -> DomainResult<()> {
        step.transition_to(StepStatus::Skipped)?;
        step.last_error = None;
        step.error_class = None;
        self.ctx.steps.update(step).await?;
        self.ctx.wake.notify_one();
        tracing::info!(
            run_id = %step.run_id,
            step_id = %step.id,
            sequence = step.sequence,
            "condition not met; step skipped"
        );
        self.ctx
            .audit
            .log_step_transition(step, AuditAction::StepSkipped, StepStatus::Pending.as_str(), StepStatus::Skipped.as_str())
            .await;
        Ok(())
    }

    /// Effective wall-clock budget: the step's own timeout, else the
    /// handler's default, else the coordinator-wide limit.
    fn effective_timeout(&self, step_def: Option<&StepDefinition>, handler_default: Option<Duration>) -> Duration {
        step_def
            .and_then(|d| d.timeout_secs)
            .map(Duration::from_secs)
            .or(handler_default)
            .unwrap_or_else(|| self.ctx.config.handler_timeout())
    }

    /// Lease, authorize, and spawn one claimed step. Returns the leased step,
    /// or `None` when another coordinator won the lease.
    async fn launch(
        &self,
        run: &Run,
        definition: &PlaybookDefinition,
        step: &StepInstance,
        siblings: &[StepInstance],
        claim: ClaimGuard,
    ) -> DomainResult<Option<StepInstance>> {
        let ctx = &self.ctx;
        let step_def = definition.step_at(step.sequence);
        let handler = ctx.registry.get(step.worker_type);
        let timeout = self.effective_timeout(step_def, handler.as_ref().and_then(|h| h.default_timeout()));
        let principal = run
            .requested_by
            .clone()
            .unwrap_or_else(|| ctx.service_principal.clone());
        let declared = step_def.map(|d| d.permissions.as_slice()).unwrap_or_default();

        let lease_until = Utc::now() + chrono::Duration::seconds((timeout.as_secs() + ctx.config.lease_grace_secs) as i64);
        if !ctx.steps.try_claim(step.id, &ctx.instance_id, lease_until).await? {
            tracing::debug!(run_id = %run.id, step_id = %step.id, "lease taken by another coordinator");
            return Ok(None);
        }

        let mut leased = step.clone();
        leased.transition_to(StepStatus::InProgress)?;
        leased.claimed_by = Some(ctx.instance_id.clone());
        leased.claimed_until = Some(lease_until);
        ctx.steps.update(&leased).await?;

        // Only the lease holder spends rate-limit budget.
        let authorization = ctx.gate.authorize(&leased, declared, &principal).await;

        ctx.audit
            .log(
                AuditEntry::new(
                    AuditLevel::Info,
                    AuditCategory::Step,
                    AuditAction::StepDispatched,
                    user_actor(&principal),
                    format!("Step {} dispatched", leased.sequence),
                )
                .with_step(&leased)
                .with_state_change(StepStatus::Pending.as_str(), StepStatus::InProgress.as_str())
                .with_metadata("attempt", serde_json::json!(leased.retry_count + 1)),
            )
            .await;

        let early_failure = match (authorization, step_def, &handler) {
            (Err(e), _, _) => Some(e),
            (Ok(()), None, _) => Some(StepError::Validation(format!(
                "playbook '{}' has no step at sequence {}",
                definition.id, leased.sequence
            ))),
            (Ok(()), _, None) => Some(StepError::Validation(format!(
                "no handler registered for worker type '{}'",
                leased.worker_type
            ))),
            _ => None,
        };

        let span = tracing::info_span!(
            "step",
            run_id = %leased.run_id,
            step_id = %leased.id,
            sequence = leased.sequence,
            worker_type = %leased.worker_type,
        );

        let ctx = Arc::clone(&self.ctx);
        match (early_failure, step_def, handler) {
            (None, Some(step_def), Some(handler)) => {
                let descriptor = StepDescriptor {
                    run_id: leased.run_id,
                    step_id: leased.id,
                    organization_id: leased.organization_id.clone(),
                    sequence: leased.sequence,
                    step_definition_id: leased.step_definition_id.clone(),
                    name: leased.name.clone(),
                    worker: step_def.worker.clone(),
                    input: leased.input_data.clone(),
                    attempt: leased.retry_count + 1,
                };
                let upstream = upstream_context(run, &leased, siblings);
                let options = ExecutionOptions {
                    timeout,
                    idempotency_key: IdempotencyGuard::step_key(leased.run_id, leased.sequence),
                    principal,
                };
                tokio::spawn(
                    async move {
                        let report = ctx.execute(handler, descriptor, upstream, options).await;
                        ctx.settle_logged(report).await;
                        drop(claim);
                        ctx.wake.notify_one();
                    }
                    .instrument(span),
                );
            }
            (failure, _, _) => {
                let error = failure.unwrap_or_else(|| StepError::System("dispatch preconditions failed".into()));
                let step_id = leased.id;
                tokio::spawn(
                    async move {
                        let report = ExecutionReport {
                            outcome: Err(error),
                            duration_ms: 0,
                            replayed: false,
                        };
                        ctx.settle_logged((step_id, report)).await;
                        drop(claim);
                        ctx.wake.notify_one();
                    }
                    .instrument(span),
                );
            }
        }

        Ok(Some(leased))
    }

    /// Recover in-progress steps whose lease expired and that no local task
    /// owns. The abandoned attempt is treated as a recoverable failure.
    pub async fn recover_expired_leases(&self, steps: &mut [StepInstance]) -> DomainResult<usize> {
        let now = Utc::now();
        let mut recovered = 0;
        for step in steps.iter_mut() {
            if step.status != StepStatus::InProgress
                || step.awaiting_signal
                || !step.lease_expired(now)
                || self.ctx.claims.contains(step.id)
            {
                continue;
            }

            tracing::warn!(
                run_id = %step.run_id,
                step_id = %step.id,
                claimed_by = ?step.claimed_by,
                "step lease expired; recovering"
            );
            let error = StepError::System(format!(
                "execution lease held by {} expired",
                step.claimed_by.as_deref().unwrap_or("unknown")
            ));
            let decision = self.ctx.retry.apply(step, &error)?;
            self.ctx.steps.update(step).await?;

            // The expired lease proves the recorded attempt was abandoned.
            let key = IdempotencyGuard::step_key(step.run_id, step.sequence);
            let released = self
                .ctx
                .idempotency
                .abandon(key.as_str(), EXECUTE_STEP_OPERATION, &step.organization_id, error.to_string())
                .await?;
            if released {
                tracing::debug!(step_id = %step.id, key = %key, "released abandoned idempotency record");
            }

            self.ctx
                .audit
                .log(
                    AuditEntry::new(
                        AuditLevel::Warning,
                        AuditCategory::Step,
                        AuditAction::LeaseRecovered,
                        daemon_actor("orchestrator"),
                        error.to_string(),
                    )
                    .with_step(step)
                    .with_metadata("will_retry", serde_json::json!(decision.is_retry())),
                )
                .await;
            recovered += 1;
        }
        Ok(recovered)
    }
}

impl DispatchContext {
    /// Run the handler behind the idempotency guard, a timeout, and a panic
    /// boundary.
    async fn execute(
        &self,
        handler: Arc<dyn WorkerHandler>,
        descriptor: StepDescriptor,
        upstream: UpstreamContext,
        options: ExecutionOptions,
    ) -> (Uuid, ExecutionReport) {
        let started = Instant::now();
        let key = options.idempotency_key.as_str().to_string();
        let scope = descriptor.organization_id.clone();
        let step_id = descriptor.step_id;

        let finish = |outcome, replayed| ExecutionReport {
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            replayed,
        };

        let check = match self.idempotency.check(&key, EXECUTE_STEP_OPERATION, &scope, None).await {
            Ok(check) => check,
            Err(e) => return (step_id, finish(Err(StepError::from(e)), false)),
        };

        if check.is_duplicate {
            let outcome = match check.cached_result {
                Some(cached) => match serde_json::from_value::<WorkerOutput>(cached) {
                    Ok(output) => {
                        tracing::info!(key = %key, "replaying recorded step result");
                        return (step_id, finish(Ok(output), true));
                    }
                    Err(e) => Err(StepError::System(format!("recorded step result is unreadable: {e}"))),
                },
                None => Err(StepError::System(format!("step execution {key} is already in progress"))),
            };
            return (step_id, finish(outcome, false));
        }

        let record_id = match self.idempotency.record(&key, EXECUTE_STEP_OPERATION, &scope).await {
            Ok(id) => id,
            Err(e) => return (step_id, finish(Err(StepError::from(e)), false)),
        };

        let timeout = options.timeout;
        let invocation = AssertUnwindSafe(handler.execute(&descriptor, &upstream, &options)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, invocation).await {
            Err(_) => Err(StepError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %detail, "step handler panicked");
                Err(StepError::System(format!("handler panicked: {detail}")))
            }
            Ok(Ok(result)) => result,
        };

        let recorded = match &outcome {
            Ok(output) => match serde_json::to_value(output) {
                Ok(value) => self.idempotency.complete(record_id, value).await,
                Err(e) => Err(e.into()),
            },
            Err(e) => self.idempotency.fail(record_id, e.to_string()).await,
        };
        if let Err(e) = recorded {
            tracing::error!(error = %e, key = %key, "failed to record step outcome");
        }

        (step_id, finish(outcome, false))
    }

    async fn settle_logged(&self, (step_id, report): (Uuid, ExecutionReport)) {
        if let Err(e) = self.settle(step_id, report).await {
            tracing::error!(step_id = %step_id, error = %e, "failed to settle step");
        }
    }

    /// Persist the outcome of one execution.
    async fn settle(&self, step_id: Uuid, report: ExecutionReport) -> DomainResult<()> {
        let Some(mut step) = self.steps.get(step_id).await? else {
            return Ok(());
        };
        if step.status != StepStatus::InProgress || step.claimed_by.as_deref() != Some(self.instance_id.as_str()) {
            tracing::warn!(
                step_id = %step_id,
                status = step.status.as_str(),
                claimed_by = ?step.claimed_by,
                "lease lost before settlement; discarding result"
            );
            return Ok(());
        }

        let run_terminal = self.runs.get(step.run_id).await?.map_or(true, |r| r.status.is_terminal());
        if run_terminal {
            step.record_error("run no longer active", ErrorClass::SystemError);
            step.transition_to(StepStatus::Skipped)?;
            self.steps.update(&step).await?;
            self.audit
                .log_step_transition(&step, AuditAction::StepSkipped, StepStatus::InProgress.as_str(), StepStatus::Skipped.as_str())
                .await;
            return Ok(());
        }

        match report.outcome {
            Ok(output) if output.awaiting_signal => {
                step.awaiting_signal = true;
                step.external_ref = output.external_ref.clone();
                step.claimed_until = None;
                step.updated_at = Utc::now();
                self.steps.update(&step).await?;
                tracing::info!(
                    external_ref = ?step.external_ref,
                    duration_ms = report.duration_ms,
                    "step awaiting external signal"
                );
                self.audit
                    .log(
                        AuditEntry::new(
                            AuditLevel::Info,
                            AuditCategory::Step,
                            AuditAction::StepStateChanged,
                            AuditActor::Worker {
                                worker_type: step.worker_type,
                            },
                            format!("Step {} awaiting external signal", step.sequence),
                        )
                        .with_step(&step)
                        .with_metadata("external_ref", serde_json::json!(step.external_ref))
                        .with_metadata("replayed", serde_json::json!(report.replayed)),
                    )
                    .await;
            }
            Ok(output) => {
                step.complete(output.data)?;
                self.steps.update(&step).await?;
                tracing::info!(duration_ms = report.duration_ms, replayed = report.replayed, "step completed");
                let action = if report.replayed {
                    AuditAction::ResultReplayed
                } else {
                    AuditAction::StepCompleted
                };
                self.audit
                    .log(
                        AuditEntry::new(
                            AuditLevel::Info,
                            AuditCategory::Step,
                            action,
                            AuditActor::Worker {
                                worker_type: step.worker_type,
                            },
                            format!("Step {} completed", step.sequence),
                        )
                        .with_step(&step)
                        .with_state_change(StepStatus::InProgress.as_str(), StepStatus::Completed.as_str())
                        .with_metadata("duration_ms", serde_json::json!(report.duration_ms))
                        .with_metadata("worker_info", serde_json::json!(output.worker_info)),
                    )
                    .await;
            }
            Err(error) => {
                let decision = self.retry.apply(&mut step, &error)?;
                self.steps.update(&step).await?;
                self.audit.log_step_error(&step, &error, decision.is_retry()).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Dependency, WorkerType};
    use serde_json::json;

    fn run() -> Run {
        Run::new("pb", "org-1", json!({"amount": 10}))
    }

    fn completed(run_id: Uuid, sequence: u32, output: serde_json::Value) -> StepInstance {
        let mut step = StepInstance::new(run_id, "org-1", sequence, format!("s{sequence}"), WorkerType::System, vec![]);
        step.transition_to(StepStatus::InProgress).unwrap();
        step.complete(output).unwrap();
        step
    }

    #[test]
    fn test_condition_evaluated_against_predecessor_output() {
        let run = run();
        let approved = completed(run.id, 1, json!({"result": {"approved": true}}));
        let gated = StepInstance::new(
            run.id,
            "org-1",
            2,
            "ship",
            WorkerType::System,
            vec![Dependency::conditional(1, "result.approved", json!(true))],
        );
        assert!(conditions_hold(&gated, &[approved.clone(), gated.clone()]));

        let rejected = completed(run.id, 1, json!({"result": {"approved": false}}));
        assert!(!conditions_hold(&gated, &[rejected, gated.clone()]));

        let no_output = completed(run.id, 1, json!({}));
        assert!(!conditions_hold(&gated, &[no_output, gated.clone()]));
    }

    #[test]
    fn test_sequential_dependencies_have_no_condition() {
        let run = run();
        let step = StepInstance::new(run.id, "org-1", 2, "b", WorkerType::System, vec![Dependency::sequential(1)]);
        assert!(conditions_hold(&step, &[]));
    }

    #[test]
    fn test_upstream_context_only_includes_earlier_completed_steps() {
        let run = run();
        let first = completed(run.id, 1, json!({"a": 1}));
        let current = StepInstance::new(run.id, "org-1", 2, "s2", WorkerType::System, vec![]);
        let later = completed(run.id, 3, json!({"c": 3}));

        let upstream = upstream_context(&run, &current, &[first, current.clone(), later]);
        assert_eq!(upstream.run_input, json!({"amount": 10}));
        assert_eq!(upstream.step_outputs.len(), 1);
        assert_eq!(upstream.step_outputs[&1], ("s1".to_string(), json!({"a": 1})));
    }
}
