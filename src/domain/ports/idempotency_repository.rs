use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{IdempotencyKey, IdempotencyRecord};

/// Repository port for idempotency records
#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    async fn insert(&self, record: &IdempotencyRecord) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<IdempotencyRecord>>;

    /// Most recent record for (key, operation, scope)
    async fn find_latest(
        &self,
        key: &IdempotencyKey,
        operation: &str,
        scope: &str,
    ) -> DomainResult<Option<IdempotencyRecord>>;

    async fn update(&self, record: &IdempotencyRecord) -> DomainResult<()>;

    /// Mark every non-expired record whose window closed before `now` as expired
    async fn expire_before(&self, now: DateTime<Utc>) -> DomainResult<u64>;
}
