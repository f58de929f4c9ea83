//! Human task assignment model.
//!
//! Created by the human worker; completing or rejecting the task is the
//! external signal that settles the owning step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanTaskStatus {
    Open,
    Completed,
    Rejected,
}

impl HumanTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub organization_id: String,
    pub title: String,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub status: HumanTaskStatus,
    pub result: Option<serde_json::Value>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl HumanTask {
    pub fn new(run_id: Uuid, step_id: Uuid, organization_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_id,
            organization_id: organization_id.into(),
            title: title.into(),
            description: None,
            assignee: None,
            status: HumanTaskStatus::Open,
            result: None,
            due_at: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == HumanTaskStatus::Open
    }
}
