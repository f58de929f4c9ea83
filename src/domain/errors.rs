//! Domain errors for the Conductor orchestration engine.
//!
//! Two families live here. [`DomainError`] covers persistence, validation, and
//! configuration failures raised by services and adapters. [`StepError`] is the
//! classified outcome of a single step execution and drives the retry decision.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::WorkerType;

/// Domain-level errors that can occur in the Conductor system.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Step not found: {0}")]
    StepNotFound(Uuid),

    #[error("Playbook definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Human task not found: {0}")]
    HumanTaskNotFound(Uuid),

    #[error("Idempotency record not found: {0}")]
    IdempotencyRecordNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid idempotency key '{key}': {reason}")]
    InvalidIdempotencyKey { key: String, reason: String },

    #[error("Unknown worker type: {0}")]
    UnknownWorkerType(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Concurrency conflict: {entity} {id} was modified")]
    ConcurrencyConflict { entity: String, id: String },
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Classification of a step failure, persisted alongside the step and
/// written to every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ValidationError,
    PermissionError,
    RateLimitError,
    TimeoutError,
    ExecutionError,
    SystemError,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::PermissionError => "permission_error",
            Self::RateLimitError => "rate_limit_error",
            Self::TimeoutError => "timeout_error",
            Self::ExecutionError => "execution_error",
            Self::SystemError => "system_error",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "validation_error" => Some(Self::ValidationError),
            "permission_error" => Some(Self::PermissionError),
            "rate_limit_error" => Some(Self::RateLimitError),
            "timeout_error" => Some(Self::TimeoutError),
            "execution_error" => Some(Self::ExecutionError),
            "system_error" => Some(Self::SystemError),
            _ => None,
        }
    }
}

/// Failure outcome of a step execution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// Malformed input, dependency graph, or idempotency key.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The security gate denied execution.
    #[error("Permission denied: missing {}", missing.join(", "))]
    Permission { missing: Vec<String> },

    /// The per-user, per-worker-type execution budget is exhausted.
    #[error("Rate limit exceeded for {worker_type} steps by {user}")]
    RateLimit { user: String, worker_type: WorkerType },

    /// The handler exceeded its wall-clock budget.
    #[error("Step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The handler failed internally. `network` marks transport-level faults.
    #[error("Execution failed: {message}")]
    Execution { message: String, network: bool },

    /// Infrastructure or persistence failure.
    #[error("System error: {0}")]
    System(String),
}

impl StepError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            network: false,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            network: true,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::ValidationError,
            Self::Permission { .. } => ErrorClass::PermissionError,
            Self::RateLimit { .. } => ErrorClass::RateLimitError,
            Self::Timeout { .. } => ErrorClass::TimeoutError,
            Self::Execution { .. } => ErrorClass::ExecutionError,
            Self::System(_) => ErrorClass::SystemError,
        }
    }

    /// Default recoverability. Permission and validation failures are never
    /// recoverable; rate limiting is governed by retry configuration.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::System(_) => true,
            Self::Execution { network, .. } => *network,
            Self::Validation(_) | Self::Permission { .. } | Self::RateLimit { .. } => false,
        }
    }
}

impl From<DomainError> for StepError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::ValidationFailed(msg) => StepError::Validation(msg),
            e @ DomainError::InvalidIdempotencyKey { .. } => StepError::Validation(e.to_string()),
            other => StepError::System(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(StepError::Timeout { timeout_ms: 10 }.is_recoverable());
        assert!(StepError::System("db down".into()).is_recoverable());
        assert!(StepError::network("connection reset").is_recoverable());
        assert!(!StepError::execution("bad payload").is_recoverable());
        assert!(!StepError::Validation("nope".into()).is_recoverable());
        assert!(!StepError::Permission { missing: vec!["x".into()] }.is_recoverable());
        assert!(!StepError::RateLimit {
            user: "u".into(),
            worker_type: WorkerType::Ai
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_class_round_trip_names() {
        for class in [
            ErrorClass::ValidationError,
            ErrorClass::PermissionError,
            ErrorClass::RateLimitError,
            ErrorClass::TimeoutError,
            ErrorClass::ExecutionError,
            ErrorClass::SystemError,
        ] {
            assert_eq!(ErrorClass::parse_str(class.as_str()), Some(class));
        }
    }

    #[test]
    fn test_permission_message_lists_missing() {
        let err = StepError::Permission {
            missing: vec!["a.b".into(), "c.d".into()],
        };
        assert_eq!(err.to_string(), "Permission denied: missing a.b, c.d");
    }

    #[test]
    fn test_domain_error_conversion() {
        let err: StepError = DomainError::ValidationFailed("bad".into()).into();
        assert_eq!(err.class(), ErrorClass::ValidationError);

        let err: StepError = DomainError::DatabaseError("locked".into()).into();
        assert_eq!(err.class(), ErrorClass::SystemError);
    }
}
