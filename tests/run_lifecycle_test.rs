//! End-to-end run lifecycle: completion, failure cascade, conditional
//! skips, optional steps, permission denial and cancellation.

mod common;

use common::{drive_to_terminal, register, test_engine, THREE_STEP_CHAIN};
use conductor::domain::models::{RunStatus, StepStatus};
use conductor::services::{AuditAction, AuditFilter};
use conductor::StartRun;
use serde_json::json;

#[tokio::test]
async fn test_three_step_run_completes_in_order() {
    let engine = test_engine().await;
    register(&engine, THREE_STEP_CHAIN).await;

    let run = engine
        .playbooks
        .start_run(StartRun::new("three-step", "acme", json!({"email": "ops@acme.test"})))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.total_steps, 3);

    let details = drive_to_terminal(&engine, run.id).await;

    assert_eq!(details.run.status, RunStatus::Completed);
    assert_eq!(details.run.current_step, 3);
    assert!(details.run.completed_at.is_some());
    assert!(details.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(details.run.output["shape"]["contact"], "ops@acme.test");
    assert_eq!(details.run.output["greet"]["greeting"], "Hello ops@acme.test");

    let first = &details.steps[0];
    let third = &details.steps[2];
    assert!(first.completed_at.unwrap() <= third.started_at.unwrap());
}

#[tokio::test]
async fn test_failed_required_step_fails_run_before_dependents_start() {
    let engine = test_engine().await;
    register(&engine, THREE_STEP_CHAIN).await;

    let run = engine
        .playbooks
        .start_run(StartRun::new("three-step", "acme", json!({})))
        .await
        .unwrap();
    let details = drive_to_terminal(&engine, run.id).await;

    assert_eq!(details.run.status, RunStatus::Failed);
    let statuses: Vec<StepStatus> = details.steps.iter().map(|s| s.status).collect();
    assert_eq!(statuses, vec![StepStatus::Failed, StepStatus::NotReady, StepStatus::NotReady]);
    assert!(details.steps[1..].iter().all(|s| s.started_at.is_none()));

    let check = &details.steps[0];
    assert_eq!(check.retry_count, 0, "validation errors are never retried");
    assert_eq!(check.error_class.map(|c| c.as_str()), Some("validation_error"));
    assert!(details.run.error.as_deref().unwrap().contains("required step 1 (check) failed"));

    let failures = engine
        .audit
        .query(AuditFilter::new().with_run(run.id).with_action(AuditAction::StepFailed))
        .await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].metadata["error_class"], "validation_error");
}

const CONDITIONAL: &str = r#"
id: tiered
name: Tiered follow-up
steps:
  - id: classify
    worker:
      type: system
      config:
        operation: transform
        mapping:
          tier: "{{input.tier}}"
  - id: gold-perks
    worker:
      type: system
      config:
        operation: transform
        mapping:
          perk: lounge
    depends_on:
      - step: 1
        kind: conditional
        condition: { path: tier, equals: gold }
  - id: wrap-up
    worker:
      type: system
      config:
        operation: transform
        mapping:
          done: "yes"
    depends_on:
      - step: 2
        kind: any
"#;

#[tokio::test]
async fn test_false_condition_skips_without_failing() {
    let engine = test_engine().await;
    register(&engine, CONDITIONAL).await;

    let silver = engine
        .playbooks
        .start_run(StartRun::new("tiered", "acme", json!({"tier": "silver"})))
        .await
        .unwrap();
    let details = drive_to_terminal(&engine, silver.id).await;

    assert_eq!(details.run.status, RunStatus::Completed);
    assert_eq!(details.steps[1].status, StepStatus::Skipped);
    assert!(details.steps[1].last_error.is_none());
    assert_eq!(details.steps[2].status, StepStatus::Completed);
    assert!(details.run.output.get("gold-perks").is_none());

    let gold = engine
        .playbooks
        .start_run(StartRun::new("tiered", "acme", json!({"tier": "gold"})))
        .await
        .unwrap();
    let details = drive_to_terminal(&engine, gold.id).await;
    assert_eq!(details.run.output["gold-perks"]["perk"], "lounge");
}

const OPTIONAL_TAIL: &str = r#"
id: optional-tail
name: Optional tail
steps:
  - id: start
    worker:
      type: system
      config:
        operation: transform
        mapping:
          ok: "true"
  - id: enrich
    required: false
    worker:
      type: system
      config:
        operation: validate
        rules:
          - field: input.missing
            check: { rule: required }
    depends_on:
      - step: 1
  - id: publish
    required: false
    worker:
      type: system
      config:
        operation: transform
        mapping:
          published: "true"
    depends_on:
      - step: 2
  - id: wrap-up
    worker:
      type: system
      config:
        operation: transform
        mapping:
          done: "true"
    depends_on:
      - { step: 2, kind: any }
"#;

#[tokio::test]
async fn test_optional_step_failure_does_not_fail_run() {
    let engine = test_engine().await;
    register(&engine, OPTIONAL_TAIL).await;

    let run = engine
        .playbooks
        .start_run(StartRun::new("optional-tail", "acme", json!({})))
        .await
        .unwrap();
    let details = drive_to_terminal(&engine, run.id).await;

    assert_eq!(details.run.status, RunStatus::Completed);
    assert_eq!(details.steps[1].status, StepStatus::Failed);
    assert_eq!(details.steps[2].status, StepStatus::Skipped);
    assert_eq!(details.steps[2].last_error.as_deref(), Some("blocked by failed step 2"));
    assert_eq!(details.steps[3].status, StepStatus::Completed);
    assert!(details.run.error.is_none());
}

#[tokio::test]
async fn test_principal_without_grants_is_denied() {
    let engine = test_engine().await;
    register(&engine, THREE_STEP_CHAIN).await;

    let run = engine
        .playbooks
        .start_run(
            StartRun::new("three-step", "acme", json!({"email": "ops@acme.test"})).requested_by("mallory"),
        )
        .await
        .unwrap();
    let details = drive_to_terminal(&engine, run.id).await;

    assert_eq!(details.run.status, RunStatus::Failed);
    let first = &details.steps[0];
    assert_eq!(first.status, StepStatus::Failed);
    assert_eq!(first.retry_count, 0);
    assert!(first
        .last_error
        .as_deref()
        .unwrap()
        .contains("playbook.step.execute.system"));

    let denials = engine
        .audit
        .query(AuditFilter::new().with_action(AuditAction::AccessDenied))
        .await;
    assert!(!denials.is_empty());
}

#[tokio::test]
async fn test_cancel_queued_run_skips_every_step() {
    let engine = test_engine().await;
    register(&engine, THREE_STEP_CHAIN).await;

    let run = engine
        .playbooks
        .start_run(StartRun::new("three-step", "acme", json!({"email": "ops@acme.test"})))
        .await
        .unwrap();
    let cancelled = engine.playbooks.cancel_run(run.id, "ops").await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    engine.daemon.tick().await.unwrap();
    let details = engine.playbooks.get_run_with_steps(run.id).await.unwrap();
    assert_eq!(details.run.status, RunStatus::Cancelled);
    assert!(details.steps.iter().all(|s| s.status == StepStatus::Skipped));
    assert!(details.steps.iter().all(|s| s.started_at.is_none()));

    assert!(engine.playbooks.cancel_run(run.id, "ops").await.is_err());
}

#[tokio::test]
async fn test_unknown_definition_is_rejected() {
    let engine = test_engine().await;
    let err = engine
        .playbooks
        .start_run(StartRun::new("nope", "acme", json!({})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"));
}
