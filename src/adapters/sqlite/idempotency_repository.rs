//! SQLite implementation of the IdempotencyRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, format_optional_datetime, parse_datetime, parse_optional_datetime, parse_optional_json, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus};
use crate::domain::ports::IdempotencyRepository;

#[derive(Clone)]
pub struct SqliteIdempotencyRepository {
    pool: SqlitePool,
}

impl SqliteIdempotencyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyRepository for SqliteIdempotencyRepository {
    async fn insert(&self, record: &IdempotencyRecord) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO idempotency_records (id, key, operation, scope, status, result, error,
               created_at, completed_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.key.as_str())
        .bind(&record.operation)
        .bind(&record.scope)
        .bind(record.status.as_str())
        .bind(record.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&record.error)
        .bind(format_datetime(record.created_at))
        .bind(format_optional_datetime(record.completed_at))
        .bind(format_datetime(record.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<IdempotencyRecord>> {
        let row: Option<IdempotencyRow> = sqlx::query_as("SELECT * FROM idempotency_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn find_latest(
        &self,
        key: &IdempotencyKey,
        operation: &str,
        scope: &str,
    ) -> DomainResult<Option<IdempotencyRecord>> {
        let row: Option<IdempotencyRow> = sqlx::query_as(
            r#"SELECT * FROM idempotency_records
               WHERE key = ? AND operation = ? AND scope = ?
               ORDER BY created_at DESC, rowid DESC
               LIMIT 1"#,
        )
        .bind(key.as_str())
        .bind(operation)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        row.map(IdempotencyRecord::try_from).transpose()
    }

    async fn update(&self, record: &IdempotencyRecord) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE idempotency_records SET status = ?, result = ?, error = ?, completed_at = ?, expires_at = ?
               WHERE id = ?"#,
        )
        .bind(record.status.as_str())
        .bind(record.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&record.error)
        .bind(format_optional_datetime(record.completed_at))
        .bind(format_datetime(record.expires_at))
        .bind(record.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::IdempotencyRecordNotFound(record.id));
        }
        Ok(())
    }

    async fn expire_before(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("UPDATE idempotency_records SET status = 'expired' WHERE status != 'expired' AND expires_at <= ?")
            .bind(format_datetime(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    id: String,
    key: String,
    operation: String,
    scope: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    expires_at: String,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = DomainError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        let status = IdempotencyStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid idempotency status: {}", row.status)))?;

        Ok(IdempotencyRecord {
            id: parse_uuid(&row.id)?,
            key: IdempotencyKey::try_from(row.key)?,
            operation: row.operation,
            scope: row.scope,
            status,
            result: parse_optional_json(row.result)?,
            error: row.error,
            created_at: parse_datetime(&row.created_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
            expires_at: parse_datetime(&row.expires_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use chrono::Duration;
    use serde_json::json;

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::parse(s, 255).unwrap()
    }

    #[tokio::test]
    async fn test_find_latest_returns_newest_attempt() {
        let repo = SqliteIdempotencyRepository::new(create_migrated_test_pool().await.unwrap());
        let expires = Utc::now() + Duration::hours(1);

        let mut first = IdempotencyRecord::new(key("invoice:1"), "send", "org-1", expires);
        first.status = IdempotencyStatus::Failed;
        first.error = Some("boom".into());
        repo.insert(&first).await.unwrap();

        let second = IdempotencyRecord::new(key("invoice:1"), "send", "org-1", expires);
        repo.insert(&second).await.unwrap();

        let latest = repo.find_latest(&key("invoice:1"), "send", "org-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        // scope and operation are part of the identity
        assert!(repo.find_latest(&key("invoice:1"), "send", "org-2").await.unwrap().is_none());
        assert!(repo.find_latest(&key("invoice:1"), "void", "org-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_and_expire() {
        let repo = SqliteIdempotencyRepository::new(create_migrated_test_pool().await.unwrap());
        let mut stale = IdempotencyRecord::new(key("a"), "op", "org-1", Utc::now() - Duration::seconds(5));
        let fresh = IdempotencyRecord::new(key("b"), "op", "org-1", Utc::now() + Duration::hours(1));
        repo.insert(&stale).await.unwrap();
        repo.insert(&fresh).await.unwrap();

        stale.status = IdempotencyStatus::Completed;
        stale.result = Some(json!({"sent": true}));
        stale.completed_at = Some(Utc::now());
        repo.update(&stale).await.unwrap();

        assert_eq!(repo.expire_before(Utc::now()).await.unwrap(), 1);
        assert_eq!(repo.expire_before(Utc::now()).await.unwrap(), 0);

        let loaded = repo.get(stale.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, IdempotencyStatus::Expired);
        assert_eq!(loaded.result, Some(json!({"sent": true})));
        assert_eq!(
            repo.get(fresh.id).await.unwrap().unwrap().status,
            IdempotencyStatus::InProgress
        );
    }
}
