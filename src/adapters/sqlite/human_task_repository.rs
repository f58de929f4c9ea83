//! SQLite implementation of the HumanTaskRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{format_datetime, format_optional_datetime, parse_datetime, parse_optional_datetime, parse_optional_json, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{HumanTask, HumanTaskStatus};
use crate::domain::ports::HumanTaskRepository;

#[derive(Clone)]
pub struct SqliteHumanTaskRepository {
    pool: SqlitePool,
}

impl SqliteHumanTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HumanTaskRepository for SqliteHumanTaskRepository {
    async fn create(&self, task: &HumanTask) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO human_tasks (id, run_id, step_id, organization_id, title, description, assignee,
               status, result, due_at, created_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(task.run_id.to_string())
        .bind(task.step_id.to_string())
        .bind(&task.organization_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.assignee)
        .bind(task.status.as_str())
        .bind(task.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(format_optional_datetime(task.due_at))
        .bind(format_datetime(task.created_at))
        .bind(format_optional_datetime(task.completed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<HumanTask>> {
        let row: Option<HumanTaskRow> = sqlx::query_as("SELECT * FROM human_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(HumanTask::try_from).transpose()
    }

    async fn find_for_step(&self, step_id: Uuid) -> DomainResult<Option<HumanTask>> {
        let row: Option<HumanTaskRow> =
            sqlx::query_as("SELECT * FROM human_tasks WHERE step_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1")
                .bind(step_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(HumanTask::try_from).transpose()
    }

    async fn update(&self, task: &HumanTask) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE human_tasks SET assignee = ?, status = ?, result = ?, due_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(&task.assignee)
        .bind(task.status.as_str())
        .bind(task.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(format_optional_datetime(task.due_at))
        .bind(format_optional_datetime(task.completed_at))
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::HumanTaskNotFound(task.id));
        }
        Ok(())
    }

    async fn count_open_for(&self, organization_id: &str, assignee: &str) -> DomainResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM human_tasks WHERE organization_id = ? AND assignee = ? AND status = 'open'",
        )
        .bind(organization_id)
        .bind(assignee)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

#[derive(sqlx::FromRow)]
struct HumanTaskRow {
    id: String,
    run_id: String,
    step_id: String,
    organization_id: String,
    title: String,
    description: Option<String>,
    assignee: Option<String>,
    status: String,
    result: Option<String>,
    due_at: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl TryFrom<HumanTaskRow> for HumanTask {
    type Error = DomainError;

    fn try_from(row: HumanTaskRow) -> Result<Self, Self::Error> {
        let status = HumanTaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid human task status: {}", row.status)))?;

        Ok(HumanTask {
            id: parse_uuid(&row.id)?,
            run_id: parse_uuid(&row.run_id)?,
            step_id: parse_uuid(&row.step_id)?,
            organization_id: row.organization_id,
            title: row.title,
            description: row.description,
            assignee: row.assignee,
            status,
            result: parse_optional_json(row.result)?,
            due_at: parse_optional_datetime(row.due_at)?,
            created_at: parse_datetime(&row.created_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
        })
    }
}
