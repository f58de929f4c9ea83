//! Per-run state advancement.

use chrono::Utc;
use serde_json::{Map, Value};

use crate::domain::errors::{DomainResult, ErrorClass};
use crate::domain::models::{Run, RunStatus, StepInstance, StepStatus};
use crate::services::audit_log::{daemon_actor, AuditAction, AuditCategory, AuditEntry, AuditLevel};

use super::daemon::{OrchestratorDaemon, TickReport};

/// Outputs of completed steps keyed by step definition id.
pub(crate) fn accumulated_output(steps: &[StepInstance]) -> Value {
    let outputs: Map<String, Value> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .filter_map(|s| s.output_data.as_ref().map(|o| (s.step_definition_id.clone(), o.clone())))
        .collect();
    Value::Object(outputs)
}

/// Lowest sequence number that is not terminal; the step count once all are.
pub(crate) fn current_step(steps: &[StepInstance]) -> u32 {
    steps
        .iter()
        .filter(|s| !s.status.is_terminal())
        .map(|s| s.sequence)
        .min()
        .unwrap_or(steps.len() as u32)
}

/// A skipped step carrying an error was blocked by a failure upstream.
fn blocked_by_failure(step: &StepInstance) -> bool {
    step.status == StepStatus::Failed || (step.status == StepStatus::Skipped && step.last_error.is_some())
}

impl OrchestratorDaemon {
    /// Advance one in-progress run. Returns `false` once the run is terminal.
    pub(super) async fn process_run(&self, mut run: Run, report: &mut TickReport) -> DomainResult<bool> {
        let Some(definition) = self.definitions.get(&run.definition_id).await? else {
            let reason = format!("playbook definition '{}' not found", run.definition_id);
            self.fail_run(&mut run, &mut [], reason, report).await?;
            return Ok(false);
        };

        let mut steps = self.steps.list_for_run(run.id).await?;

        report.leases_recovered += self.dispatcher.recover_expired_leases(&mut steps).await?;

        let now = Utc::now();
        for step in steps.iter_mut().filter(|s| s.retry_due(now)) {
            step.transition_to(StepStatus::Pending)?;
            self.steps.update(step).await?;
            report.steps_promoted += 1;
            tracing::debug!(run_id = %step.run_id, step_id = %step.id, retry_count = step.retry_count, "retry due");
        }

        // A doomed run fails before anything downstream is promoted or skipped.
        if self.fail_on_required_failure(&mut run, &mut steps, report).await? {
            return Ok(false);
        }

        self.resolve_waiting(&mut steps, report).await?;

        if !self.reconcile(&mut run, &mut steps, report).await? {
            return Ok(false);
        }

        report.steps_dispatched += self.dispatcher.dispatch_ready(&run, &definition, &mut steps).await?;
        Ok(true)
    }

    /// Promote `not_ready` steps whose dependencies are satisfied and skip
    /// those that can never run, until nothing changes.
    async fn resolve_waiting(&self, steps: &mut [StepInstance], report: &mut TickReport) -> DomainResult<()> {
        loop {
            let mut changed = false;
            for idx in 0..steps.len() {
                if steps[idx].status != StepStatus::NotReady {
                    continue;
                }

                let blockers: Vec<&StepInstance> = self
                    .resolver
                    .blocking_dependencies(&steps[idx], steps)
                    .iter()
                    .filter_map(|dep| steps.iter().find(|s| s.sequence == dep.step_number))
                    .collect();

                if !blockers.is_empty() {
                    let failed_upstream = blockers.iter().find(|s| blocked_by_failure(s)).map(|s| s.sequence);
                    let step = &mut steps[idx];
                    step.transition_to(StepStatus::Skipped)?;
                    if let Some(sequence) = failed_upstream {
                        step.record_error(format!("blocked by failed step {sequence}"), ErrorClass::ExecutionError);
                    }
                    self.steps.update(step).await?;
                    self.audit
                        .log_step_transition(
                            step,
                            AuditAction::StepSkipped,
                            StepStatus::NotReady.as_str(),
                            StepStatus::Skipped.as_str(),
                        )
                        .await;
                    report.steps_skipped += 1;
                    changed = true;
                } else if self.resolver.is_ready(&steps[idx], steps) {
                    let step = &mut steps[idx];
                    step.transition_to(StepStatus::Pending)?;
                    self.steps.update(step).await?;
                    self.audit
                        .log_step_transition(
                            step,
                            AuditAction::StepStateChanged,
                            StepStatus::NotReady.as_str(),
                            StepStatus::Pending.as_str(),
                        )
                        .await;
                    report.steps_promoted += 1;
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Fail, complete, or record progress on the run. Returns whether the
    /// run is still in progress.
    async fn reconcile(&self, run: &mut Run, steps: &mut [StepInstance], report: &mut TickReport) -> DomainResult<bool> {
        if self.fail_on_required_failure(run, steps, report).await? {
            return Ok(false);
        }

        let output = accumulated_output(steps);
        if steps.iter().all(|s| s.status.is_terminal()) {
            run.output = output;
            run.current_step = current_step(steps);
            run.transition_to(RunStatus::Completed)?;
            self.runs.update(run).await?;
            tracing::info!(run_id = %run.id, definition_id = %run.definition_id, "run completed");
            self.audit_run(run, AuditAction::RunCompleted, AuditLevel::Info, "Run completed").await;
            report.runs_completed += 1;
            return Ok(false);
        }

        let current = current_step(steps);
        if run.output != output || run.current_step != current {
            run.output = output;
            run.current_step = current;
            run.updated_at = Utc::now();
            self.runs.update(run).await?;
        }
        Ok(true)
    }

    /// Fail the run if a required step failed or was blocked. Returns whether
    /// the run was failed.
    async fn fail_on_required_failure(
        &self,
        run: &mut Run,
        steps: &mut [StepInstance],
        report: &mut TickReport,
    ) -> DomainResult<bool> {
        let Some(failed) = steps.iter().find(|s| s.required && blocked_by_failure(s)) else {
            return Ok(false);
        };
        let reason = format!(
            "required step {} ({}) failed: {}",
            failed.sequence,
            failed.step_definition_id,
            failed.last_error.as_deref().unwrap_or("unknown error")
        );
        self.fail_run(run, steps, reason, report).await?;
        Ok(true)
    }

    /// Fail the run and skip its steps that were ready or parked on an
    /// external signal. Steps still waiting on dependencies stay `not_ready`.
    async fn fail_run(
        &self,
        run: &mut Run,
        steps: &mut [StepInstance],
        reason: String,
        report: &mut TickReport,
    ) -> DomainResult<()> {
        run.output = accumulated_output(steps);
        run.fail(reason.clone())?;
        self.runs.update(run).await?;

        for step in steps.iter_mut() {
            if step.status == StepStatus::RetryPending {
                step.transition_to(StepStatus::Pending)?;
            }
            let waiting_on_signal = step.status == StepStatus::InProgress && step.awaiting_signal;
            if waiting_on_signal || step.status == StepStatus::Pending {
                step.transition_to(StepStatus::Skipped)?;
                self.steps.update(step).await?;
            }
        }

        tracing::warn!(run_id = %run.id, definition_id = %run.definition_id, reason = %reason, "run failed");
        self.audit_run(run, AuditAction::RunFailed, AuditLevel::Error, &reason).await;
        report.runs_failed += 1;
        Ok(())
    }

    async fn audit_run(&self, run: &Run, action: AuditAction, level: AuditLevel, message: &str) {
        self.audit
            .log(
                AuditEntry::new(level, AuditCategory::Run, action, daemon_actor("orchestrator"), message)
                    .with_organization(run.organization_id.clone())
                    .with_run(run.id)
                    .with_state_change(RunStatus::InProgress.as_str(), run.status.as_str()),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::WorkerType;
    use serde_json::json;
    use uuid::Uuid;

    fn step(run_id: Uuid, sequence: u32, status: StepStatus) -> StepInstance {
        let mut s = StepInstance::new(run_id, "org", sequence, format!("s{sequence}"), WorkerType::System, vec![]);
        s.status = status;
        s
    }

    #[test]
    fn test_accumulates_completed_outputs_by_definition_id() {
        let run_id = Uuid::new_v4();
        let mut done = step(run_id, 1, StepStatus::Completed);
        done.output_data = Some(json!({"ok": true}));
        let pending = step(run_id, 2, StepStatus::Pending);

        assert_eq!(accumulated_output(&[done, pending]), json!({"s1": {"ok": true}}));
    }

    #[test]
    fn test_current_step_is_lowest_non_terminal() {
        let run_id = Uuid::new_v4();
        let steps = vec![
            step(run_id, 1, StepStatus::Completed),
            step(run_id, 2, StepStatus::InProgress),
            step(run_id, 3, StepStatus::NotReady),
        ];
        assert_eq!(current_step(&steps), 2);

        let finished = vec![step(run_id, 1, StepStatus::Completed), step(run_id, 2, StepStatus::Skipped)];
        assert_eq!(current_step(&finished), 2);
    }

    #[test]
    fn test_skip_without_error_is_not_a_failure() {
        let run_id = Uuid::new_v4();
        let mut skipped = step(run_id, 1, StepStatus::Skipped);
        assert!(!blocked_by_failure(&skipped));
        skipped.last_error = Some("blocked by failed step 0".into());
        assert!(blocked_by_failure(&skipped));
        assert!(blocked_by_failure(&step(run_id, 2, StepStatus::Failed)));
    }
}
