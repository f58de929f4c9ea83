//! Idempotency guard.
//!
//! Deduplicates operations by (key, operation, scope). A completed record
//! inside its validity window is replayed verbatim; an in-progress record
//! younger than the stuck threshold is reported as a duplicate, and an older
//! one is marked failed so a fresh attempt may proceed.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{IdempotencyConfig, IdempotencyKey, IdempotencyRecord, IdempotencyStatus};
use crate::domain::ports::IdempotencyRepository;

/// Operation name used for step executions.
pub const EXECUTE_STEP_OPERATION: &str = "execute_step";

/// Result of an idempotency check.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyCheck {
    pub is_duplicate: bool,
    /// Present when a completed record is being replayed
    pub cached_result: Option<serde_json::Value>,
}

impl IdempotencyCheck {
    fn fresh() -> Self {
        Self {
            is_duplicate: false,
            cached_result: None,
        }
    }
}

/// Outcome of [`IdempotencyGuard::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    /// The operation ran in this call
    Executed(T),
    /// A completed record was found and its result returned
    Replayed(serde_json::Value),
    /// Another attempt is still in flight
    InFlight,
}

pub struct IdempotencyGuard {
    repository: Arc<dyn IdempotencyRepository>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(repository: Arc<dyn IdempotencyRepository>, config: IdempotencyConfig) -> Self {
        Self { repository, config }
    }

    /// Deterministic key for one step of a run.
    pub fn step_key(run_id: Uuid, sequence: u32) -> IdempotencyKey {
        IdempotencyKey::for_step(run_id, sequence)
    }

    /// Validate a caller-supplied key against the configured length bound.
    pub fn parse_key(&self, key: &str) -> DomainResult<IdempotencyKey> {
        IdempotencyKey::parse(key, self.config.max_key_length)
    }

    /// Look up the latest record for (key, operation, scope).
    ///
    /// `expiration` narrows the replay window below the record's own expiry.
    pub async fn check(
        &self,
        key: &str,
        operation: &str,
        scope: &str,
        expiration: Option<Duration>,
    ) -> DomainResult<IdempotencyCheck> {
        let key = self.parse_key(key)?;
        let Some(mut record) = self.repository.find_latest(&key, operation, scope).await? else {
            return Ok(IdempotencyCheck::fresh());
        };

        let now = Utc::now();
        match record.status {
            IdempotencyStatus::Completed => {
                let within_window = expiration.map_or(true, |window| {
                    record.created_at + chrono::Duration::seconds(window.as_secs() as i64) > now
                });
                if !record.is_expired(now) && within_window {
                    tracing::debug!(key = %key, operation, "replaying completed operation");
                    return Ok(IdempotencyCheck {
                        is_duplicate: true,
                        cached_result: record.result.clone(),
                    });
                }
                Ok(IdempotencyCheck::fresh())
            }
            IdempotencyStatus::InProgress => {
                let stuck_after = chrono::Duration::seconds(self.config.stuck_threshold_secs as i64);
                if now - record.created_at < stuck_after {
                    return Ok(IdempotencyCheck {
                        is_duplicate: true,
                        cached_result: None,
                    });
                }

                tracing::warn!(
                    key = %key,
                    operation,
                    record_id = %record.id,
                    "idempotency record stuck in progress; allowing a fresh attempt"
                );
                record.status = IdempotencyStatus::Failed;
                record.error = Some("abandoned while in progress".to_string());
                record.completed_at = Some(now);
                self.repository.update(&record).await?;
                Ok(IdempotencyCheck::fresh())
            }
            IdempotencyStatus::Failed | IdempotencyStatus::Expired => Ok(IdempotencyCheck::fresh()),
        }
    }

    /// Start tracking an attempt. Returns the record id.
    pub async fn record(&self, key: &str, operation: &str, scope: &str) -> DomainResult<Uuid> {
        let key = self.parse_key(key)?;
        let expires_at = Utc::now() + chrono::Duration::seconds(self.config.expiration_secs as i64);
        let record = IdempotencyRecord::new(key, operation, scope, expires_at);
        self.repository.insert(&record).await?;
        Ok(record.id)
    }

    pub async fn complete(&self, record_id: Uuid, result: serde_json::Value) -> DomainResult<()> {
        let mut record = self.load(record_id).await?;
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        record.error = None;
        record.completed_at = Some(Utc::now());
        self.repository.update(&record).await
    }

    pub async fn fail(&self, record_id: Uuid, error: impl Into<String>) -> DomainResult<()> {
        let mut record = self.load(record_id).await?;
        record.status = IdempotencyStatus::Failed;
        record.error = Some(error.into());
        record.completed_at = Some(Utc::now());
        self.repository.update(&record).await
    }

    /// Fail the in-progress record for (key, operation, scope), if any, so
    /// the next attempt runs instead of waiting out the stuck threshold.
    /// Returns whether a record was released.
    pub async fn abandon(&self, key: &str, operation: &str, scope: &str, reason: impl Into<String>) -> DomainResult<bool> {
        let key = self.parse_key(key)?;
        let Some(mut record) = self.repository.find_latest(&key, operation, scope).await? else {
            return Ok(false);
        };
        if record.status != IdempotencyStatus::InProgress {
            return Ok(false);
        }
        record.status = IdempotencyStatus::Failed;
        record.error = Some(reason.into());
        record.completed_at = Some(Utc::now());
        self.repository.update(&record).await?;
        Ok(true)
    }

    /// Run `operation` at most once per (key, operation, scope).
    ///
    /// Successful results are serialized into the record; failures release
    /// the key so a later attempt runs again.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        operation: &str,
        scope: &str,
        f: F,
    ) -> DomainResult<Guarded<Result<T, E>>>
    where
        T: Serialize,
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let check = self.check(key, operation, scope, None).await?;
        if check.is_duplicate {
            return Ok(match check.cached_result {
                Some(result) => Guarded::Replayed(result),
                None => Guarded::InFlight,
            });
        }

        let record_id = self.record(key, operation, scope).await?;
        let result = f().await;
        match &result {
            Ok(value) => self.complete(record_id, serde_json::to_value(value)?).await?,
            Err(e) => self.fail(record_id, e.to_string()).await?,
        }
        Ok(Guarded::Executed(result))
    }

    /// Mark every record past its window as expired.
    pub async fn purge_expired(&self) -> DomainResult<u64> {
        let purged = self.repository.expire_before(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "expired idempotency records");
        }
        Ok(purged)
    }

    async fn load(&self, record_id: Uuid) -> DomainResult<IdempotencyRecord> {
        self.repository
            .get(record_id)
            .await?
            .ok_or(DomainError::IdempotencyRecordNotFound(record_id))
    }
}
