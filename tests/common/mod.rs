//! Common test utilities for integration tests
//!
//! Builds engines over in-memory databases with a fast retry ladder and
//! drives runs with explicit daemon ticks.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor::adapters::http::ScriptedTransport;
use conductor::adapters::notifications::OutboxNotifier;
use conductor::adapters::sqlite::create_migrated_test_pool;
use conductor::domain::models::Config;
use conductor::domain::ports::HttpTransport;
use conductor::services::RunDetails;
use conductor::Engine;
use uuid::Uuid;

/// Configuration with millisecond retry delays and short timeouts.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.orchestrator.poll_interval_ms = 20;
    config.orchestrator.drain_timeout_secs = 2;
    config.orchestrator.lease_grace_secs = 5;
    config.retry.delays_ms = vec![10, 20, 30];
    config.retry.default_max_retries = 3;
    config
}

/// Build an engine over a fresh in-memory database.
pub async fn engine_with(config: Config, transport: Arc<dyn HttpTransport>) -> Engine {
    let pool = create_migrated_test_pool().await.expect("test pool");
    Engine::builder(config)
        .with_instance_id("test-node")
        .with_transport(transport)
        .with_notifier(Arc::new(OutboxNotifier::new()))
        .build(pool)
        .expect("engine builds")
}

/// Build an engine with the test configuration and a transport that always
/// answers 200.
pub async fn test_engine() -> Engine {
    let transport = Arc::new(ScriptedTransport::new().status(200, serde_json::json!({"ok": true})));
    engine_with(test_config(), transport).await
}

pub async fn register(engine: &Engine, yaml: &str) {
    engine
        .playbooks
        .register_definition_yaml(yaml)
        .await
        .expect("definition registers");
}

/// Tick the daemon until the run is terminal or the deadline passes.
pub async fn drive_to_terminal(engine: &Engine, run_id: Uuid) -> RunDetails {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        engine.daemon.tick().await.expect("tick succeeds");
        let details = engine.playbooks.get_run_with_steps(run_id).await.expect("run exists");
        if details.run.status.is_terminal() {
            return details;
        }
        assert!(
            Instant::now() < deadline,
            "run {run_id} did not finish: {:?}",
            details.steps.iter().map(|s| (s.sequence, s.status)).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Tick until `predicate` holds for the run, returning the details.
pub async fn drive_until<F>(engine: &Engine, run_id: Uuid, mut predicate: F) -> RunDetails
where
    F: FnMut(&RunDetails) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        engine.daemon.tick().await.expect("tick succeeds");
        let details = engine.playbooks.get_run_with_steps(run_id).await.expect("run exists");
        if predicate(&details) {
            return details;
        }
        assert!(Instant::now() < deadline, "condition not reached for run {run_id}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Three system steps: step 2 depends on step 1 and step 3 waits for both
/// to reach any terminal state. The first validates `input.email`.
pub const THREE_STEP_CHAIN: &str = r#"
id: three-step
name: Three step chain
steps:
  - id: check
    worker:
      type: system
      config:
        operation: validate
        rules:
          - field: input.email
            check: { rule: required }
  - id: shape
    worker:
      type: system
      config:
        operation: transform
        mapping:
          contact: "{{input.email}}"
    depends_on:
      - step: 1
  - id: greet
    worker:
      type: system
      config:
        operation: transform
        mapping:
          greeting: "Hello {{steps.shape.contact}}"
    depends_on:
      - { step: 1, kind: any }
      - { step: 2, kind: any }
"#;
