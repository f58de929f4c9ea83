//! Idempotency record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Lifecycle of a deduplicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Characters permitted in an idempotency key besides ASCII alphanumerics.
const KEY_PUNCTUATION: &[char] = &['_', '-', '.', ':'];

/// A validated idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const DEFAULT_MAX_LENGTH: usize = 255;

    /// Validate a caller-supplied key against the given length bound.
    pub fn parse(key: impl Into<String>, max_length: usize) -> DomainResult<Self> {
        let key = key.into();
        let invalid = |reason: &str| DomainError::InvalidIdempotencyKey {
            key: key.chars().take(64).collect(),
            reason: reason.to_string(),
        };

        if key.trim().is_empty() {
            return Err(invalid("key must not be empty"));
        }
        if key.len() > max_length {
            return Err(invalid(&format!("key exceeds {max_length} characters")));
        }
        if let Some(bad) = key
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || KEY_PUNCTUATION.contains(c)))
        {
            return Err(invalid(&format!("character '{bad}' is not allowed")));
        }
        Ok(Self(key))
    }

    /// Deterministic key for executing one step of a run.
    pub fn for_step(run_id: Uuid, sequence: u32) -> Self {
        Self(format!("run:{run_id}:step:{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value, Self::DEFAULT_MAX_LENGTH)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted record of one guarded operation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub key: IdempotencyKey,
    pub operation: String,
    /// Organization scope
    pub scope: String,
    pub status: IdempotencyStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(
        key: IdempotencyKey,
        operation: impl Into<String>,
        scope: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            operation: operation.into(),
            scope: scope.into(),
            status: IdempotencyStatus::InProgress,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Expired || self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(IdempotencyKey::parse("invoice:42:send", 255).is_ok());
        assert!(IdempotencyKey::parse("a-b_c.d", 255).is_ok());
        assert!(IdempotencyKey::parse("", 255).is_err());
        assert!(IdempotencyKey::parse("   ", 255).is_err());
        assert!(IdempotencyKey::parse("has space", 255).is_err());
        assert!(IdempotencyKey::parse("semi;colon", 255).is_err());
        assert!(IdempotencyKey::parse("x".repeat(256), 255).is_err());
        assert!(IdempotencyKey::parse("x".repeat(255), 255).is_ok());
    }

    #[test]
    fn test_step_key_is_valid_and_deterministic() {
        let run_id = Uuid::new_v4();
        let a = IdempotencyKey::for_step(run_id, 3);
        let b = IdempotencyKey::for_step(run_id, 3);
        assert_eq!(a, b);
        assert!(IdempotencyKey::parse(a.as_str(), 255).is_ok());
    }

    #[test]
    fn test_deserialize_rejects_malformed_key() {
        let result: Result<IdempotencyKey, _> = serde_json::from_value(serde_json::json!("bad key!"));
        assert!(result.is_err());
    }
}
