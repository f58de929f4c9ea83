use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Run, RunStatus};

/// Filters for querying runs
#[derive(Default, Debug, Clone)]
pub struct RunFilter {
    /// Match any of these statuses; empty matches all
    pub statuses: Vec<RunStatus>,
    /// Match any of these organizations; empty matches all
    pub organizations: Vec<String>,
    pub definition_id: Option<String>,
    pub limit: Option<i64>,
}

impl RunFilter {
    pub fn active(organizations: Vec<String>) -> Self {
        Self {
            statuses: vec![RunStatus::Queued, RunStatus::InProgress],
            organizations,
            ..Default::default()
        }
    }
}

/// Repository port for run persistence. Results are ordered by creation time.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create(&self, run: &Run) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Run>>;

    async fn update(&self, run: &Run) -> DomainResult<()>;

    async fn list(&self, filter: RunFilter) -> DomainResult<Vec<Run>>;
}
