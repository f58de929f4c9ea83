//! Step instance domain model.
//!
//! One step instance exists per (run, sequence number). Instances are
//! materialized when the run is created and only change state through
//! [`StepInstance::transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult, ErrorClass};

/// Execution modality of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    System,
    Human,
    Ai,
    External,
}

impl WorkerType {
    pub const ALL: [WorkerType; 4] = [Self::System, Self::Human, Self::Ai, Self::External];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Human => "human",
            Self::Ai => "ai",
            Self::External => "external",
        }
    }

    /// Parse a worker type name. Unknown names are a configuration error.
    pub fn parse_str(s: &str) -> DomainResult<Self> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Self::System),
            "human" => Ok(Self::Human),
            "ai" => Ok(Self::Ai),
            "external" => Ok(Self::External),
            _ => Err(DomainError::UnknownWorkerType(s.to_string())),
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Dependencies not yet satisfied
    NotReady,
    /// Ready to be claimed by the dispatcher
    Pending,
    /// Claimed and executing (or awaiting an external signal)
    InProgress,
    /// Failed recoverably, waiting for `retry_at`
    RetryPending,
    Completed,
    Failed,
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::NotReady
    }
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::RetryPending => "retry_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "not_ready" => Some(Self::NotReady),
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "retry_pending" => Some(Self::RetryPending),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<StepStatus> {
        match self {
            Self::NotReady => vec![Self::Pending, Self::Skipped],
            Self::Pending => vec![Self::InProgress, Self::Skipped],
            Self::InProgress => vec![Self::Completed, Self::RetryPending, Self::Failed, Self::Skipped],
            Self::RetryPending => vec![Self::Pending],
            Self::Completed | Self::Failed | Self::Skipped => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }

    /// Stored statuses a write of `self` may replace. Cancellation moves a
    /// `retry_pending` step through `pending` in memory, so `skipped` also
    /// accepts it.
    pub fn persisted_predecessors(&self) -> &'static [StepStatus] {
        match self {
            Self::NotReady => &[Self::NotReady],
            Self::Pending => &[Self::NotReady, Self::RetryPending, Self::Pending],
            Self::InProgress => &[Self::Pending, Self::InProgress],
            Self::RetryPending => &[Self::InProgress, Self::RetryPending],
            Self::Completed => &[Self::InProgress, Self::Completed],
            Self::Failed => &[Self::InProgress, Self::Failed],
            Self::Skipped => &[
                Self::NotReady,
                Self::Pending,
                Self::InProgress,
                Self::RetryPending,
                Self::Skipped,
            ],
        }
    }
}

/// Precedence rule between two steps of the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Predecessor must complete successfully.
    Sequential,
    /// Predecessor must complete; the step's condition is then evaluated.
    Conditional,
    /// Predecessor must reach any terminal state.
    Any,
    /// Unrecognized kind from stored data; follows the sequential rule.
    #[serde(other)]
    Unknown,
}

impl Default for DependencyKind {
    fn default() -> Self {
        Self::Sequential
    }
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Conditional => "conditional",
            Self::Any => "any",
            Self::Unknown => "unknown",
        }
    }
}

/// Equality test against a predecessor's output, used by conditional
/// dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    /// Dotted path into the predecessor's output (`result.approved`).
    pub path: String,
    /// Value the path must equal for the step to run.
    pub equals: serde_json::Value,
}

/// A dependency on an earlier step of the same run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(alias = "step")]
    pub step_number: u32,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
}

impl Dependency {
    pub fn sequential(step_number: u32) -> Self {
        Self {
            step_number,
            kind: DependencyKind::Sequential,
            condition: None,
        }
    }

    pub fn any(step_number: u32) -> Self {
        Self {
            step_number,
            kind: DependencyKind::Any,
            condition: None,
        }
    }

    pub fn conditional(step_number: u32, path: impl Into<String>, equals: serde_json::Value) -> Self {
        Self {
            step_number,
            kind: DependencyKind::Conditional,
            condition: Some(StepCondition {
                path: path.into(),
                equals,
            }),
        }
    }
}

/// One unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: Uuid,
    pub run_id: Uuid,
    pub organization_id: String,
    /// 1-based, unique within the run
    pub sequence: u32,
    /// Id of the step within its playbook definition
    pub step_definition_id: String,
    pub name: String,
    pub worker_type: WorkerType,
    pub status: StepStatus,
    /// Required steps fail the run when they fail
    pub required: bool,
    pub input_data: serde_json::Value,
    /// Present only after success
    pub output_data: Option<serde_json::Value>,
    pub dependencies: Vec<Dependency>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
    /// Coordinator instance holding the execution lease
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    /// Handler returned; completion arrives via an external signal
    pub awaiting_signal: bool,
    /// Reference to the external artifact (human task id)
    pub external_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepInstance {
    /// Create a step instance. Steps without dependencies start `pending`.
    pub fn new(
        run_id: Uuid,
        organization_id: impl Into<String>,
        sequence: u32,
        step_definition_id: impl Into<String>,
        worker_type: WorkerType,
        dependencies: Vec<Dependency>,
    ) -> Self {
        let now = Utc::now();
        let status = if dependencies.is_empty() {
            StepStatus::Pending
        } else {
            StepStatus::NotReady
        };
        let step_definition_id = step_definition_id.into();
        Self {
            id: Uuid::new_v4(),
            run_id,
            organization_id: organization_id.into(),
            sequence,
            name: step_definition_id.clone(),
            step_definition_id,
            worker_type,
            status,
            required: true,
            input_data: serde_json::Value::Null,
            output_data: None,
            dependencies,
            retry_count: 0,
            max_retries: 3,
            retry_at: None,
            last_error: None,
            error_class: None,
            claimed_by: None,
            claimed_until: None,
            awaiting_signal: false,
            external_ref: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input_data = input;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// The single mutation point for step status.
    pub fn transition_to(&mut self, new_status: StepStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
                reason: format!("step {} of run {}", self.sequence, self.run_id),
            });
        }

        let now = Utc::now();
        match new_status {
            StepStatus::InProgress => {
                self.started_at = Some(now);
                self.awaiting_signal = false;
            }
            StepStatus::Pending => {
                self.retry_at = None;
            }
            s if s.is_terminal() => {
                self.completed_at = Some(now);
                self.claimed_by = None;
                self.claimed_until = None;
                self.awaiting_signal = false;
            }
            _ => {}
        }
        if new_status == StepStatus::RetryPending {
            self.claimed_by = None;
            self.claimed_until = None;
        }

        self.status = new_status;
        self.updated_at = now;
        Ok(())
    }

    /// Mark the step completed with its output.
    pub fn complete(&mut self, output: serde_json::Value) -> DomainResult<()> {
        self.transition_to(StepStatus::Completed)?;
        self.output_data = Some(output);
        self.last_error = None;
        self.error_class = None;
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>, class: ErrorClass) {
        self.last_error = Some(message.into());
        self.error_class = Some(class);
        self.updated_at = Utc::now();
    }

    /// Whether the execution lease expired before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.claimed_until, Some(until) if until < now)
    }

    /// Whether a `retry_pending` step may be returned to `pending`.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::RetryPending && self.retry_at.map_or(true, |at| at <= now)
    }
}
