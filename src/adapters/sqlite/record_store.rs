//! SQLite-backed generic record store.
//!
//! Records are free-form JSON objects grouped by organization and entity
//! type. Updates merge top-level fields.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, parse_json};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::RecordStore;

#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ensure_object(fields: &Value) -> DomainResult<()> {
    if fields.is_object() {
        Ok(())
    } else {
        Err(DomainError::ValidationFailed("record fields must be a JSON object".to_string()))
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_record(&self, organization_id: &str, entity_type: &str, fields: Value) -> DomainResult<String> {
        ensure_object(&fields)?;
        let id = Uuid::new_v4().to_string();
        let now = format_datetime(Utc::now());
        sqlx::query(
            "INSERT INTO records (id, organization_id, entity_type, fields, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(organization_id)
        .bind(entity_type)
        .bind(serde_json::to_string(&fields)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_record(
        &self,
        organization_id: &str,
        entity_type: &str,
        record_id: &str,
        fields: Value,
    ) -> DomainResult<bool> {
        ensure_object(&fields)?;
        let mut tx = self.pool.begin().await?;
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT fields FROM records WHERE id = ? AND organization_id = ? AND entity_type = ?")
                .bind(record_id)
                .bind(organization_id)
                .bind(entity_type)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((current,)) = existing else {
            return Ok(false);
        };

        let mut merged: Value = parse_json(&current)?;
        if let (Some(target), Value::Object(updates)) = (merged.as_object_mut(), fields) {
            target.extend(updates);
        }

        sqlx::query("UPDATE records SET fields = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&merged)?)
            .bind(format_datetime(Utc::now()))
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_record(&self, organization_id: &str, entity_type: &str, record_id: &str) -> DomainResult<Option<Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT fields FROM records WHERE id = ? AND organization_id = ? AND entity_type = ?")
                .bind(record_id)
                .bind(organization_id)
                .bind(entity_type)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(fields,)| parse_json(&fields)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_update_merges_fields() {
        let store = SqliteRecordStore::new(create_migrated_test_pool().await.unwrap());
        let id = store
            .create_record("org-1", "vendor", json!({"name": "Acme", "status": "new"}))
            .await
            .unwrap();

        assert!(store
            .update_record("org-1", "vendor", &id, json!({"status": "approved"}))
            .await
            .unwrap());

        let record = store.get_record("org-1", "vendor", &id).await.unwrap().unwrap();
        assert_eq!(record, json!({"name": "Acme", "status": "approved"}));
    }

    #[tokio::test]
    async fn test_records_are_scoped_by_organization() {
        let store = SqliteRecordStore::new(create_migrated_test_pool().await.unwrap());
        let id = store.create_record("org-1", "vendor", json!({"name": "Acme"})).await.unwrap();

        assert!(store.get_record("org-2", "vendor", &id).await.unwrap().is_none());
        assert!(!store
            .update_record("org-2", "vendor", &id, json!({"name": "Evil"}))
            .await
            .unwrap());
        assert!(store.create_record("org-1", "vendor", json!("scalar")).await.is_err());
    }
}
