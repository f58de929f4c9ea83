//! Audit logging service.
//!
//! Records security checks, step failures, state changes, and engine
//! lifecycle events. Entries are kept in a bounded in-memory buffer and can
//! be queried for post-hoc analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::StepError;
use crate::domain::models::{StepInstance, WorkerType};

/// Configuration for the audit log service.
#[derive(Debug, Clone)]
pub struct AuditLogConfig {
    /// Maximum entries to keep in memory.
    pub max_entries: usize,
    /// Log level threshold.
    pub min_level: AuditLevel,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            max_entries: 10000,
            min_level: AuditLevel::Info,
        }
    }
}

/// Audit log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Category of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Run lifecycle.
    Run,
    /// Step execution and state changes.
    Step,
    /// Permission and rate-limit checks.
    Security,
    /// Deduplication decisions.
    Idempotency,
    /// Coordinator lifecycle and maintenance.
    System,
    /// Definition registration.
    Definition,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Step => "step",
            Self::Security => "security",
            Self::Idempotency => "idempotency",
            Self::System => "system",
            Self::Definition => "definition",
        }
    }
}

/// Type of state change or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Run actions
    RunCreated,
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,

    // Step actions
    StepStateChanged,
    StepDispatched,
    StepCompleted,
    StepFailed,
    StepRetried,
    StepSkipped,
    LeaseRecovered,
    HumanTaskResolved,

    // Security actions
    AccessGranted,
    AccessDenied,
    RateLimited,

    // Idempotency actions
    ResultReplayed,
    RecordsExpired,

    // System actions
    DaemonStarted,
    DaemonStopped,
    DefinitionRegistered,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
            Self::StepStateChanged => "step_state_changed",
            Self::StepDispatched => "step_dispatched",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepRetried => "step_retried",
            Self::StepSkipped => "step_skipped",
            Self::LeaseRecovered => "lease_recovered",
            Self::HumanTaskResolved => "human_task_resolved",
            Self::AccessGranted => "access_granted",
            Self::AccessDenied => "access_denied",
            Self::RateLimited => "rate_limited",
            Self::ResultReplayed => "result_replayed",
            Self::RecordsExpired => "records_expired",
            Self::DaemonStarted => "daemon_started",
            Self::DaemonStopped => "daemon_stopped",
            Self::DefinitionRegistered => "definition_registered",
        }
    }
}

/// Actor that caused the audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActor {
    /// Coordinator action.
    System,
    /// Principal a run executes on behalf of.
    User { identifier: String },
    /// Background process.
    Daemon { name: String },
    /// Worker handler.
    Worker { worker_type: WorkerType },
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub category: AuditCategory,
    pub action: AuditAction,
    pub actor: AuditActor,
    pub organization_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub message: String,
    /// Previous state (for state changes).
    pub previous_state: Option<String>,
    /// New state (for state changes).
    pub new_state: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn new(
        level: AuditLevel,
        category: AuditCategory,
        action: AuditAction,
        actor: AuditActor,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            category,
            action,
            actor,
            organization_id: None,
            run_id: None,
            step_id: None,
            message: message.into(),
            previous_state: None,
            new_state: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attach run, step, organization, and worker type of a step.
    pub fn with_step(mut self, step: &StepInstance) -> Self {
        self.organization_id = Some(step.organization_id.clone());
        self.run_id = Some(step.run_id);
        self.step_id = Some(step.id);
        self.with_metadata("worker_type", serde_json::json!(step.worker_type.as_str()))
            .with_metadata("sequence", serde_json::json!(step.sequence))
    }

    pub fn with_state_change(mut self, previous: impl Into<String>, new: impl Into<String>) -> Self {
        self.previous_state = Some(previous.into());
        self.new_state = Some(new.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Filter for querying audit logs.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub min_level: Option<AuditLevel>,
    pub category: Option<AuditCategory>,
    pub action: Option<AuditAction>,
    pub organization_id: Option<String>,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_level(mut self, level: AuditLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn with_category(mut self, category: AuditCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if self.min_level.is_some_and(|min| entry.level < min) {
            return false;
        }
        if self.category.is_some_and(|c| entry.category != c) {
            return false;
        }
        if self.action.is_some_and(|a| entry.action != a) {
            return false;
        }
        if let Some(ref org) = self.organization_id {
            if entry.organization_id.as_ref() != Some(org) {
                return false;
            }
        }
        if self.run_id.is_some() && entry.run_id != self.run_id {
            return false;
        }
        if self.step_id.is_some() && entry.step_id != self.step_id {
            return false;
        }
        true
    }
}

/// Statistics about the audit log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total_entries: usize,
    pub by_level: HashMap<String, usize>,
    pub by_category: HashMap<String, usize>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub denials: usize,
}

/// In-memory audit log service.
pub struct AuditLogService {
    config: AuditLogConfig,
    entries: Arc<RwLock<VecDeque<AuditEntry>>>,
}

impl AuditLogService {
    pub fn new(config: AuditLogConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AuditLogConfig::default())
    }

    /// Log an audit entry.
    pub async fn log(&self, entry: AuditEntry) {
        if entry.level < self.config.min_level {
            return;
        }

        let mut entries = self.entries.write().await;
        while entries.len() >= self.config.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Log a step status change.
    pub async fn log_step_transition(
        &self,
        step: &StepInstance,
        action: AuditAction,
        previous_state: impl Into<String>,
        new_state: impl Into<String>,
    ) {
        let prev = previous_state.into();
        let new = new_state.into();
        self.log(
            AuditEntry::new(
                AuditLevel::Info,
                AuditCategory::Step,
                action,
                AuditActor::System,
                format!("Step {} changed from {} to {}", step.sequence, prev, new),
            )
            .with_step(step)
            .with_state_change(prev, new),
        )
        .await;
    }

    /// Log a failed execution with its classification.
    pub async fn log_step_error(&self, step: &StepInstance, error: &StepError, will_retry: bool) {
        let level = if will_retry { AuditLevel::Warning } else { AuditLevel::Error };
        let action = if will_retry { AuditAction::StepRetried } else { AuditAction::StepFailed };
        self.log(
            AuditEntry::new(
                level,
                AuditCategory::Step,
                action,
                AuditActor::Worker {
                    worker_type: step.worker_type,
                },
                error.to_string(),
            )
            .with_step(step)
            .with_metadata("error_class", serde_json::json!(error.class().as_str()))
            .with_metadata("retry_count", serde_json::json!(step.retry_count)),
        )
        .await;
    }

    /// Query audit entries, newest first.
    pub async fn query(&self, filter: AuditFilter) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        let mut results: Vec<AuditEntry> = entries.iter().filter(|e| filter.matches(e)).cloned().collect();

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        results
    }

    pub async fn run_history(&self, run_id: Uuid) -> Vec<AuditEntry> {
        self.query(AuditFilter::new().with_run(run_id)).await
    }

    pub async fn stats(&self) -> AuditStats {
        let entries = self.entries.read().await;

        let mut by_level: HashMap<String, usize> = HashMap::new();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut denials = 0;

        for entry in entries.iter() {
            *by_level.entry(entry.level.as_str().to_string()).or_default() += 1;
            *by_category.entry(entry.category.as_str().to_string()).or_default() += 1;
            if matches!(entry.action, AuditAction::AccessDenied | AuditAction::RateLimited) {
                denials += 1;
            }
        }

        AuditStats {
            total_entries: entries.len(),
            by_level,
            by_category,
            oldest_entry: entries.front().map(|e| e.timestamp),
            newest_entry: entries.back().map(|e| e.timestamp),
            denials,
        }
    }

}

pub fn user_actor(identifier: impl Into<String>) -> AuditActor {
    AuditActor::User {
        identifier: identifier.into(),
    }
}

pub fn daemon_actor(name: impl Into<String>) -> AuditActor {
    AuditActor::Daemon { name: name.into() }
}
