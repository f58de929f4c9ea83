//! Run domain model.
//!
//! A run is one execution of a playbook definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Status of a playbook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn valid_transitions(&self) -> Vec<RunStatus> {
        match self {
            Self::Queued => vec![Self::InProgress, Self::Failed, Self::Cancelled],
            Self::InProgress => vec![Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// One execution instance of a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub definition_id: String,
    pub organization_id: String,
    pub status: RunStatus,
    pub total_steps: u32,
    /// Lowest sequence number that is not yet terminal
    pub current_step: u32,
    pub input: serde_json::Value,
    /// Outputs of completed steps keyed by step definition id
    pub output: serde_json::Value,
    /// Free-form execution context
    pub context: serde_json::Value,
    /// Principal the security gate evaluates step permissions for
    pub requested_by: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        definition_id: impl Into<String>,
        organization_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            organization_id: organization_id.into(),
            status: RunStatus::Queued,
            total_steps: 0,
            current_step: 1,
            input,
            output: serde_json::Value::Object(serde_json::Map::new()),
            context: serde_json::Value::Object(serde_json::Map::new()),
            requested_by: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_requested_by(mut self, principal: impl Into<String>) -> Self {
        self.requested_by = Some(principal.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn transition_to(&mut self, new_status: RunStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
                reason: format!("run {}", self.id),
            });
        }

        let now = Utc::now();
        if new_status == RunStatus::InProgress {
            self.started_at = Some(now);
        }
        if new_status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = new_status;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        self.transition_to(RunStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new("onboarding", "org-1", serde_json::json!({}));
        assert_eq!(run.status, RunStatus::Queued);
        run.transition_to(RunStatus::InProgress).unwrap();
        assert!(run.started_at.is_some());
        run.transition_to(RunStatus::Completed).unwrap();
        assert!(run.completed_at.is_some());
        assert!(run.transition_to(RunStatus::Cancelled).is_err());
    }

    #[test]
    fn test_queued_run_can_be_cancelled() {
        let mut run = Run::new("onboarding", "org-1", serde_json::json!({}));
        run.transition_to(RunStatus::Cancelled).unwrap();
        assert!(run.status.is_terminal());
    }

    #[test]
    fn test_fail_records_reason() {
        let mut run = Run::new("onboarding", "org-1", serde_json::json!({}));
        run.transition_to(RunStatus::InProgress).unwrap();
        run.fail("step 2 failed").unwrap();
        assert_eq!(run.error.as_deref(), Some("step 2 failed"));
    }

    #[test]
    fn test_status_parsing_accepts_both_spellings() {
        assert_eq!(RunStatus::from_str("canceled"), Some(RunStatus::Cancelled));
        assert_eq!(RunStatus::from_str("in_progress"), Some(RunStatus::InProgress));
        assert_eq!(RunStatus::from_str("bogus"), None);
    }
}
