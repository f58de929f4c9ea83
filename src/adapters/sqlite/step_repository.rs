//! SQLite implementation of the StepRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{
    format_datetime, format_optional_datetime, parse_datetime, parse_json, parse_optional_datetime,
    parse_optional_json, parse_uuid,
};
use crate::domain::errors::{DomainError, DomainResult, ErrorClass};
use crate::domain::models::{Dependency, StepInstance, StepStatus, WorkerType};
use crate::domain::ports::StepRepository;

#[derive(Clone)]
pub struct SqliteStepRepository {
    pool: SqlitePool,
}

impl SqliteStepRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepRepository for SqliteStepRepository {
    async fn create_many(&self, steps: &[StepInstance]) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                r#"INSERT INTO steps (id, run_id, organization_id, sequence, step_definition_id, name,
                   worker_type, status, required, input_data, output_data, dependencies, retry_count,
                   max_retries, retry_at, last_error, error_class, claimed_by, claimed_until,
                   awaiting_signal, external_ref, created_at, updated_at, started_at, completed_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(step.id.to_string())
            .bind(step.run_id.to_string())
            .bind(&step.organization_id)
            .bind(step.sequence as i64)
            .bind(&step.step_definition_id)
            .bind(&step.name)
            .bind(step.worker_type.as_str())
            .bind(step.status.as_str())
            .bind(step.required)
            .bind(serde_json::to_string(&step.input_data)?)
            .bind(step.output_data.as_ref().map(serde_json::to_string).transpose()?)
            .bind(serde_json::to_string(&step.dependencies)?)
            .bind(step.retry_count as i64)
            .bind(step.max_retries as i64)
            .bind(format_optional_datetime(step.retry_at))
            .bind(&step.last_error)
            .bind(step.error_class.map(|c| c.as_str()))
            .bind(&step.claimed_by)
            .bind(format_optional_datetime(step.claimed_until))
            .bind(step.awaiting_signal)
            .bind(&step.external_ref)
            .bind(format_datetime(step.created_at))
            .bind(format_datetime(step.updated_at))
            .bind(format_optional_datetime(step.started_at))
            .bind(format_optional_datetime(step.completed_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<StepInstance>> {
        let row: Option<StepRow> = sqlx::query_as("SELECT * FROM steps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(StepInstance::try_from).transpose()
    }

    async fn list_for_run(&self, run_id: Uuid) -> DomainResult<Vec<StepInstance>> {
        let rows: Vec<StepRow> = sqlx::query_as("SELECT * FROM steps WHERE run_id = ? ORDER BY sequence ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StepInstance::try_from).collect()
    }

    async fn list_by_status(&self, status: StepStatus) -> DomainResult<Vec<StepInstance>> {
        let rows: Vec<StepRow> =
            sqlx::query_as("SELECT * FROM steps WHERE status = ? ORDER BY created_at ASC, sequence ASC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(StepInstance::try_from).collect()
    }

    async fn update(&self, step: &StepInstance) -> DomainResult<()> {
        let expected = step
            .status
            .persisted_predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"UPDATE steps SET status = ?, input_data = ?, output_data = ?, retry_count = ?, max_retries = ?,
               retry_at = ?, last_error = ?, error_class = ?, claimed_by = ?, claimed_until = ?,
               awaiting_signal = ?, external_ref = ?, updated_at = ?, started_at = ?, completed_at = ?
               WHERE id = ? AND status IN ({expected})"#
        );
        let result = sqlx::query(&sql)
            .bind(step.status.as_str())
            .bind(serde_json::to_string(&step.input_data)?)
            .bind(step.output_data.as_ref().map(serde_json::to_string).transpose()?)
            .bind(step.retry_count as i64)
            .bind(step.max_retries as i64)
            .bind(format_optional_datetime(step.retry_at))
            .bind(&step.last_error)
            .bind(step.error_class.map(|c| c.as_str()))
            .bind(&step.claimed_by)
            .bind(format_optional_datetime(step.claimed_until))
            .bind(step.awaiting_signal)
            .bind(&step.external_ref)
            .bind(format_datetime(step.updated_at))
            .bind(format_optional_datetime(step.started_at))
            .bind(format_optional_datetime(step.completed_at))
            .bind(step.id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return match self.get(step.id).await? {
                Some(stored) => Err(DomainError::ConcurrencyConflict {
                    entity: "step".to_string(),
                    id: format!("{} (stored {}, wrote {})", step.id, stored.status.as_str(), step.status.as_str()),
                }),
                None => Err(DomainError::StepNotFound(step.id)),
            };
        }
        Ok(())
    }

    async fn try_claim(&self, step_id: Uuid, owner: &str, until: DateTime<Utc>) -> DomainResult<bool> {
        let now = format_datetime(Utc::now());
        let result = sqlx::query(
            r#"UPDATE steps SET status = 'in_progress', claimed_by = ?, claimed_until = ?,
               awaiting_signal = 0, started_at = ?, updated_at = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(owner)
        .bind(format_datetime(until))
        .bind(&now)
        .bind(&now)
        .bind(step_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    organization_id: String,
    sequence: i64,
    step_definition_id: String,
    name: String,
    worker_type: String,
    status: String,
    required: bool,
    input_data: String,
    output_data: Option<String>,
    dependencies: String,
    retry_count: i64,
    max_retries: i64,
    retry_at: Option<String>,
    last_error: Option<String>,
    error_class: Option<String>,
    claimed_by: Option<String>,
    claimed_until: Option<String>,
    awaiting_signal: bool,
    external_ref: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<StepRow> for StepInstance {
    type Error = DomainError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let status = StepStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid step status: {}", row.status)))?;
        let worker_type = WorkerType::parse_str(&row.worker_type)
            .map_err(|_| DomainError::SerializationError(format!("Invalid worker type: {}", row.worker_type)))?;
        let error_class = row
            .error_class
            .map(|c| {
                ErrorClass::parse_str(&c)
                    .ok_or_else(|| DomainError::SerializationError(format!("Invalid error class: {c}")))
            })
            .transpose()?;
        let dependencies: Vec<Dependency> = parse_json(&row.dependencies)?;

        Ok(StepInstance {
            id: parse_uuid(&row.id)?,
            run_id: parse_uuid(&row.run_id)?,
            organization_id: row.organization_id,
            sequence: row.sequence as u32,
            step_definition_id: row.step_definition_id,
            name: row.name,
            worker_type,
            status,
            required: row.required,
            input_data: parse_json(&row.input_data)?,
            output_data: parse_optional_json(row.output_data)?,
            dependencies,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            retry_at: parse_optional_datetime(row.retry_at)?,
            last_error: row.last_error,
            error_class,
            claimed_by: row.claimed_by,
            claimed_until: parse_optional_datetime(row.claimed_until)?,
            awaiting_signal: row.awaiting_signal,
            external_ref: row.external_ref,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
        })
    }
}
