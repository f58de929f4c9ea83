//! Scheduling loop and lifecycle of the orchestrator daemon.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{OrchestratorConfig, RunStatus};
use crate::domain::ports::{DefinitionRepository, RunFilter, RunRepository, StepRepository};
use crate::services::audit_log::{daemon_actor, AuditAction, AuditCategory, AuditEntry, AuditLevel, AuditLogService};
use crate::services::dependency_resolver::DependencyResolver;
use crate::services::dispatcher::StepDispatcher;
use crate::services::idempotency_guard::IdempotencyGuard;

/// Status of the orchestrator daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    /// Whether the scheduling loop is running.
    pub running: bool,
    pub instance_id: String,
    /// Runs in progress as of the last tick.
    pub active_runs: usize,
    /// Steps executing under a local claim.
    pub in_flight: usize,
    pub total_ticks: u64,
    pub failed_ticks: u64,
    pub consecutive_failures: u32,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub runs_completed: u64,
    pub runs_failed: u64,
    /// Effective configuration.
    pub config: OrchestratorConfig,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub runs_started: usize,
    pub steps_promoted: usize,
    pub steps_skipped: usize,
    pub steps_dispatched: usize,
    pub leases_recovered: usize,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub records_purged: u64,
}

/// Repositories and services the daemon drives.
pub struct OrchestratorDeps {
    pub runs: Arc<dyn RunRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub definitions: Arc<dyn DefinitionRepository>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub audit: Arc<AuditLogService>,
}

pub struct OrchestratorDaemon {
    pub(super) config: OrchestratorConfig,
    pub(super) runs: Arc<dyn RunRepository>,
    pub(super) steps: Arc<dyn StepRepository>,
    pub(super) definitions: Arc<dyn DefinitionRepository>,
    pub(super) idempotency: Arc<IdempotencyGuard>,
    pub(super) audit: Arc<AuditLogService>,
    pub(super) resolver: DependencyResolver,
    pub(super) dispatcher: StepDispatcher,
    wake: Arc<Notify>,
    stop_flag: Arc<AtomicBool>,
    status: Arc<RwLock<DaemonStatus>>,
    tick_lock: Mutex<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    last_purge: Mutex<Option<Instant>>,
}

impl OrchestratorDaemon {
    /// `wake` must be the same notifier the dispatcher signals when a step
    /// settles.
    pub fn new(config: OrchestratorConfig, deps: OrchestratorDeps, dispatcher: StepDispatcher, wake: Arc<Notify>) -> Self {
        let status = DaemonStatus {
            running: false,
            instance_id: dispatcher.instance_id().to_string(),
            active_runs: 0,
            in_flight: 0,
            total_ticks: 0,
            failed_ticks: 0,
            consecutive_failures: 0,
            last_tick_at: None,
            last_error: None,
            runs_completed: 0,
            runs_failed: 0,
            config: config.clone(),
        };
        Self {
            config,
            runs: deps.runs,
            steps: deps.steps,
            definitions: deps.definitions,
            idempotency: deps.idempotency,
            audit: deps.audit,
            resolver: DependencyResolver::new(),
            dispatcher,
            wake,
            stop_flag: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(status)),
            tick_lock: Mutex::new(()),
            loop_handle: Mutex::new(None),
            last_purge: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Lease owner name of this coordinator.
    pub fn instance_id(&self) -> &str {
        self.dispatcher.instance_id()
    }

    /// Start the scheduling loop. Starting a running daemon is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            tracing::warn!("orchestrator daemon already running");
            return;
        }

        self.stop_flag.store(false, Ordering::Release);
        self.status.write().await.running = true;

        tracing::info!(
            instance_id = self.dispatcher.instance_id(),
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent_runs = self.config.max_concurrent_runs,
            max_concurrent_steps_per_run = self.config.max_concurrent_steps_per_run,
            "orchestrator daemon started"
        );
        self.audit_lifecycle(AuditAction::DaemonStarted, "Orchestrator daemon started")
            .await;

        let daemon = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { daemon.run_loop().await }));
    }

    /// Stop the loop and wait up to the drain timeout for in-flight steps.
    /// Returns `true` when every in-flight step settled in time.
    pub async fn stop(&self) -> bool {
        self.stop_flag.store(true, Ordering::Release);
        self.wake.notify_one();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "orchestrator loop terminated abnormally");
            }
        }

        let claims = Arc::clone(self.dispatcher.claims());
        let drained = tokio::time::timeout(self.config.drain_timeout(), async {
            while !claims.is_empty() {
                tokio::select! {
                    _ = claims.released() => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        })
        .await
        .is_ok();

        if drained {
            tracing::info!("orchestrator daemon stopped; all steps settled");
        } else {
            tracing::warn!(
                remaining = claims.len(),
                "drain timeout elapsed; abandoned steps will be recovered by lease expiry"
            );
        }

        self.status.write().await.running = false;
        self.audit_lifecycle(AuditAction::DaemonStopped, "Orchestrator daemon stopped")
            .await;
        drained
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Wake the loop for a newly created run instead of waiting for the
    /// next poll.
    pub fn notify_new_run(&self, run_id: Uuid) {
        tracing::debug!(run_id = %run_id, "new run submitted");
        self.wake.notify_one();
    }

    /// Wake the loop after an external signal settled a step.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn status(&self) -> DaemonStatus {
        let mut status = self.status.read().await.clone();
        status.in_flight = self.dispatcher.claims().len();
        status
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if self.is_stop_requested() {
                break;
            }

            let started = Instant::now();
            match self.tick().await {
                Ok(report) => {
                    if report != TickReport::default() {
                        tracing::debug!(
                            duration_ms = started.elapsed().as_millis() as u64,
                            report = ?report,
                            "tick completed"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "orchestrator tick failed");
                }
            }
        }
    }

    /// One scheduling pass.
    pub async fn tick(&self) -> DomainResult<TickReport> {
        let _serial = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        let outcome = self.tick_inner(&mut report).await;

        let mut status = self.status.write().await;
        status.total_ticks += 1;
        status.last_tick_at = Some(Utc::now());
        status.runs_completed += report.runs_completed as u64;
        status.runs_failed += report.runs_failed as u64;
        match &outcome {
            Ok(active) => {
                status.active_runs = *active;
                status.consecutive_failures = 0;
            }
            Err(e) => {
                status.failed_ticks += 1;
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
            }
        }
        outcome.map(|_| report)
    }

    async fn tick_inner(&self, report: &mut TickReport) -> DomainResult<usize> {
        self.purge_if_due(report).await;

        let runs = self
            .runs
            .list(RunFilter::active(self.config.organizations.clone()))
            .await?;
        let (mut active, queued): (Vec<_>, Vec<_>) = runs
            .into_iter()
            .filter(|r| self.config.serves(&r.organization_id))
            .partition(|r| r.status == RunStatus::InProgress);

        let capacity = self.config.max_concurrent_runs.saturating_sub(active.len());
        for mut run in queued.into_iter().take(capacity) {
            run.transition_to(RunStatus::InProgress)?;
            self.runs.update(&run).await?;
            tracing::info!(run_id = %run.id, definition_id = %run.definition_id, "run started");
            self.audit
                .log(
                    AuditEntry::new(
                        AuditLevel::Info,
                        AuditCategory::Run,
                        AuditAction::RunStarted,
                        daemon_actor("orchestrator"),
                        format!("Run of '{}' started", run.definition_id),
                    )
                    .with_organization(run.organization_id.clone())
                    .with_run(run.id)
                    .with_state_change(RunStatus::Queued.as_str(), RunStatus::InProgress.as_str()),
                )
                .await;
            report.runs_started += 1;
            active.push(run);
        }

        let mut still_active = 0;
        for run in active {
            let run_id = run.id;
            match self.process_run(run, report).await {
                Ok(true) => still_active += 1,
                Ok(false) => {}
                Err(DomainError::ConcurrencyConflict { id, .. }) => {
                    still_active += 1;
                    tracing::debug!(run_id = %run_id, step = %id, "run advanced by another coordinator");
                }
                Err(e) => {
                    still_active += 1;
                    tracing::error!(run_id = %run_id, error = %e, "failed to advance run");
                }
            }
        }
        Ok(still_active)
    }

    async fn purge_if_due(&self, report: &mut TickReport) {
        let every = Duration::from_secs(self.config.idempotency_purge_interval_secs);
        let mut last = self.last_purge.lock().await;
        if last.is_some_and(|at| at.elapsed() < every) {
            return;
        }
        *last = Some(Instant::now());

        match self.idempotency.purge_expired().await {
            Ok(purged) => {
                report.records_purged = purged;
                if purged > 0 {
                    self.audit
                        .log(
                            AuditEntry::new(
                                AuditLevel::Info,
                                AuditCategory::Idempotency,
                                AuditAction::RecordsExpired,
                                daemon_actor("orchestrator"),
                                format!("{purged} idempotency records expired"),
                            )
                            .with_metadata("purged", serde_json::json!(purged)),
                        )
                        .await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "idempotency purge failed"),
        }

        let tracked = self.dispatcher.prune_rate_limits();
        tracing::debug!(tracked, "pruned idle rate-limit keys");
    }

    async fn audit_lifecycle(&self, action: AuditAction, message: &str) {
        self.audit
            .log(
                AuditEntry::new(
                    AuditLevel::Info,
                    AuditCategory::System,
                    action,
                    daemon_actor("orchestrator"),
                    message,
                )
                .with_metadata("instance_id", serde_json::json!(self.dispatcher.instance_id())),
            )
            .await;
    }
}
