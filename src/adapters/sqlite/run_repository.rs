//! SQLite implementation of the RunRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, format_optional_datetime, parse_datetime, parse_json, parse_optional_datetime, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Run, RunStatus};
use crate::domain::ports::{RunFilter, RunRepository};

#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create(&self, run: &Run) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO runs (id, definition_id, organization_id, status, total_steps, current_step,
               input, output, context, requested_by, error, created_at, updated_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.definition_id)
        .bind(&run.organization_id)
        .bind(run.status.as_str())
        .bind(run.total_steps as i64)
        .bind(run.current_step as i64)
        .bind(serde_json::to_string(&run.input)?)
        .bind(serde_json::to_string(&run.output)?)
        .bind(serde_json::to_string(&run.context)?)
        .bind(&run.requested_by)
        .bind(&run.error)
        .bind(format_datetime(run.created_at))
        .bind(format_datetime(run.updated_at))
        .bind(format_optional_datetime(run.started_at))
        .bind(format_optional_datetime(run.completed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Run::try_from).transpose()
    }

    async fn update(&self, run: &Run) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE runs SET status = ?, total_steps = ?, current_step = ?, output = ?, context = ?,
               error = ?, updated_at = ?, started_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(run.status.as_str())
        .bind(run.total_steps as i64)
        .bind(run.current_step as i64)
        .bind(serde_json::to_string(&run.output)?)
        .bind(serde_json::to_string(&run.context)?)
        .bind(&run.error)
        .bind(format_datetime(run.updated_at))
        .bind(format_optional_datetime(run.started_at))
        .bind(format_optional_datetime(run.completed_at))
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::RunNotFound(run.id));
        }
        Ok(())
    }

    async fn list(&self, filter: RunFilter) -> DomainResult<Vec<Run>> {
        let mut query = String::from("SELECT * FROM runs WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if !filter.statuses.is_empty() {
            query.push_str(&format!(" AND status IN ({})", placeholders(filter.statuses.len())));
            bindings.extend(filter.statuses.iter().map(|s| s.as_str().to_string()));
        }
        if !filter.organizations.is_empty() {
            query.push_str(&format!(" AND organization_id IN ({})", placeholders(filter.organizations.len())));
            bindings.extend(filter.organizations.iter().cloned());
        }
        if let Some(definition_id) = &filter.definition_id {
            query.push_str(" AND definition_id = ?");
            bindings.push(definition_id.clone());
        }

        query.push_str(" ORDER BY created_at ASC, rowid ASC");
        if filter.limit.is_some() {
            query.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query_as::<_, RunRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }
        if let Some(limit) = filter.limit {
            q = q.bind(limit);
        }

        let rows: Vec<RunRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Run::try_from).collect()
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    definition_id: String,
    organization_id: String,
    status: String,
    total_steps: i64,
    current_step: i64,
    input: String,
    output: String,
    context: String,
    requested_by: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = DomainError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = RunStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid run status: {}", row.status)))?;

        Ok(Run {
            id: parse_uuid(&row.id)?,
            definition_id: row.definition_id,
            organization_id: row.organization_id,
            status,
            total_steps: row.total_steps as u32,
            current_step: row.current_step as u32,
            input: parse_json(&row.input)?,
            output: parse_json(&row.output)?,
            context: parse_json(&row.context)?,
            requested_by: row.requested_by,
            error: row.error,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
        })
    }
}
