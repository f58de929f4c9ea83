//! Idempotency guard: replay of completed work and single side effects.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{drive_to_terminal, engine_with, register, test_config};
use conductor::adapters::http::ScriptedTransport;
use conductor::adapters::sqlite::{create_migrated_test_pool, SqliteIdempotencyRepository, SqliteStepRepository};
use conductor::domain::models::{IdempotencyConfig, RunStatus, StepStatus, WorkerOutput};
use conductor::domain::ports::StepRepository;
use conductor::services::{AuditAction, AuditFilter, Guarded, IdempotencyGuard};
use conductor::StartRun;
use serde_json::json;

async fn guard() -> IdempotencyGuard {
    let pool = create_migrated_test_pool().await.unwrap();
    IdempotencyGuard::new(
        Arc::new(SqliteIdempotencyRepository::new(pool)),
        IdempotencyConfig::default(),
    )
}

#[tokio::test]
async fn test_check_record_complete_replays_with_single_side_effect() {
    let guard = guard().await;
    let side_effects = AtomicUsize::new(0);

    let first = guard.check("invoice:42", "charge", "acme", None).await.unwrap();
    assert!(!first.is_duplicate);
    let record_id = guard.record("invoice:42", "charge", "acme").await.unwrap();
    side_effects.fetch_add(1, Ordering::SeqCst);
    guard.complete(record_id, json!({"charged": 100})).await.unwrap();

    let second = guard.check("invoice:42", "charge", "acme", None).await.unwrap();
    assert!(second.is_duplicate);
    assert_eq!(second.cached_result, Some(json!({"charged": 100})));
    if !second.is_duplicate {
        side_effects.fetch_add(1, Ordering::SeqCst);
    }
    assert_eq!(side_effects.load(Ordering::SeqCst), 1);

    let other_scope = guard.check("invoice:42", "charge", "globex", None).await.unwrap();
    assert!(!other_scope.is_duplicate);
}

#[tokio::test]
async fn test_execute_runs_closure_once() {
    let guard = guard().await;
    let counter = AtomicUsize::new(0);
    let calls = &counter;

    for _ in 0..3 {
        let outcome = guard
            .execute("welcome-mail:7", "send", "acme", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!({"sent": true}))
            })
            .await
            .unwrap();
        match outcome {
            Guarded::Executed(result) => assert_eq!(result.unwrap(), json!({"sent": true})),
            Guarded::Replayed(value) => assert_eq!(value, json!({"sent": true})),
            Guarded::InFlight => panic!("nothing should be in flight"),
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_attempt_releases_key() {
    let guard = guard().await;

    let failed = guard
        .execute("sync:1", "push", "acme", || async { Err::<serde_json::Value, _>("remote down") })
        .await
        .unwrap();
    assert!(matches!(failed, Guarded::Executed(Err(_))));

    let retried = guard
        .execute("sync:1", "push", "acme", || async { Ok::<_, String>(json!({"pushed": 1})) })
        .await
        .unwrap();
    assert!(matches!(retried, Guarded::Executed(Ok(_))));
}

#[tokio::test]
async fn test_in_progress_record_is_a_duplicate_until_stuck() {
    let pool = create_migrated_test_pool().await.unwrap();
    let repository = Arc::new(SqliteIdempotencyRepository::new(pool));
    let fresh = IdempotencyGuard::new(repository.clone(), IdempotencyConfig::default());

    fresh.record("export:9", "export", "acme").await.unwrap();
    let check = fresh.check("export:9", "export", "acme", None).await.unwrap();
    assert!(check.is_duplicate);
    assert!(check.cached_result.is_none());

    let impatient = IdempotencyGuard::new(
        repository,
        IdempotencyConfig {
            stuck_threshold_secs: 0,
            ..IdempotencyConfig::default()
        },
    );
    let check = impatient.check("export:9", "export", "acme", None).await.unwrap();
    assert!(!check.is_duplicate);
}

#[tokio::test]
async fn test_malformed_keys_are_rejected() {
    let guard = guard().await;
    assert!(guard.check("", "op", "acme", None).await.is_err());
    assert!(guard.check("has space", "op", "acme", None).await.is_err());
    assert!(guard.check(&"k".repeat(256), "op", "acme", None).await.is_err());
    assert!(guard.check(&"k".repeat(255), "op", "acme", None).await.is_ok());
}

const CHARGE: &str = r#"
id: charge
name: Charge customer
steps:
  - id: charge
    worker:
      type: external
      config:
        url: "https://payments.example.test/charges"
        method: POST
        body: { amount: "{{input.amount}}" }
        retry: { max_attempts: 1 }
"#;

#[tokio::test]
async fn test_recorded_step_result_is_replayed_not_re_executed() {
    let transport = Arc::new(ScriptedTransport::new().status(200, json!({"charge_id": "fresh"})));
    let engine = engine_with(test_config(), transport.clone()).await;
    register(&engine, CHARGE).await;

    let run = engine
        .playbooks
        .start_run(StartRun::new("charge", "acme", json!({"amount": 100})))
        .await
        .unwrap();

    // A previous coordinator finished the call but crashed before settling.
    let steps = SqliteStepRepository::new(engine.pool.clone()).list_for_run(run.id).await.unwrap();
    let guard = IdempotencyGuard::new(
        Arc::new(SqliteIdempotencyRepository::new(engine.pool.clone())),
        IdempotencyConfig::default(),
    );
    let key = IdempotencyGuard::step_key(run.id, steps[0].sequence);
    let record_id = guard.record(key.as_str(), "execute_step", "acme").await.unwrap();
    let prior = WorkerOutput::completed(json!({"charge_id": "original"}));
    guard
        .complete(record_id, serde_json::to_value(&prior).unwrap())
        .await
        .unwrap();

    let details = drive_to_terminal(&engine, run.id).await;

    assert_eq!(details.run.status, RunStatus::Completed);
    assert_eq!(details.steps[0].status, StepStatus::Completed);
    assert_eq!(details.steps[0].output_data, Some(json!({"charge_id": "original"})));
    assert!(transport.requests().is_empty(), "the charge must not be sent twice");

    let replays = engine
        .audit
        .query(AuditFilter::new().with_run(run.id).with_action(AuditAction::ResultReplayed))
        .await;
    assert_eq!(replays.len(), 1);
}
