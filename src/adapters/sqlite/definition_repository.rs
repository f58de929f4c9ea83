//! SQLite implementation of the DefinitionRepository.
//!
//! The definition body is stored as JSON; the scalar columns exist for
//! lookup and listing.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::{format_datetime, parse_json};
use crate::domain::errors::DomainResult;
use crate::domain::models::PlaybookDefinition;
use crate::domain::ports::DefinitionRepository;

#[derive(Clone)]
pub struct SqliteDefinitionRepository {
    pool: SqlitePool,
}

impl SqliteDefinitionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionRepository for SqliteDefinitionRepository {
    async fn upsert(&self, definition: &PlaybookDefinition) -> DomainResult<()> {
        let now = format_datetime(Utc::now());
        sqlx::query(
            r#"INSERT INTO playbook_definitions (id, organization_id, name, version, body, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   organization_id = excluded.organization_id,
                   name = excluded.name,
                   version = excluded.version,
                   body = excluded.body,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&definition.id)
        .bind(&definition.organization_id)
        .bind(&definition.name)
        .bind(definition.version as i64)
        .bind(serde_json::to_string(definition)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> DomainResult<Option<PlaybookDefinition>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM playbook_definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(body,)| parse_json(&body)).transpose()
    }

    async fn list_for_organization(&self, organization_id: &str) -> DomainResult<Vec<PlaybookDefinition>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT body FROM playbook_definitions WHERE organization_id = ? OR organization_id IS NULL ORDER BY id",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|(body,)| parse_json(&body)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    fn definition(id: &str, org: Option<&str>) -> PlaybookDefinition {
        PlaybookDefinition::from_yaml(&format!(
            r#"
id: {id}
name: Test {id}
steps:
  - id: check
    worker:
      type: system
      config:
        operation: validate
        rules:
          - field: input.amount
            check:
              rule: required
"#
        ))
        .map(|mut d| {
            d.organization_id = org.map(str::to_string);
            d
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_definition() {
        let repo = SqliteDefinitionRepository::new(create_migrated_test_pool().await.unwrap());
        let mut def = definition("invoice", Some("org-1"));
        repo.upsert(&def).await.unwrap();

        def.version = 2;
        def.name = "Invoice v2".into();
        repo.upsert(&def).await.unwrap();

        let loaded = repo.get("invoice").await.unwrap().unwrap();
        assert_eq!(loaded, def);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_includes_global_definitions() {
        let repo = SqliteDefinitionRepository::new(create_migrated_test_pool().await.unwrap());
        repo.upsert(&definition("a-mine", Some("org-1"))).await.unwrap();
        repo.upsert(&definition("b-global", None)).await.unwrap();
        repo.upsert(&definition("c-theirs", Some("org-2"))).await.unwrap();

        let visible: Vec<String> = repo
            .list_for_organization("org-1")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(visible, vec!["a-mine".to_string(), "b-global".to_string()]);
    }
}
