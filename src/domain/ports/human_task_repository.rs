use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::HumanTask;

/// Repository port for human task assignments
#[async_trait]
pub trait HumanTaskRepository: Send + Sync {
    async fn create(&self, task: &HumanTask) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<HumanTask>>;

    async fn find_for_step(&self, step_id: Uuid) -> DomainResult<Option<HumanTask>>;

    async fn update(&self, task: &HumanTask) -> DomainResult<()>;

    /// Number of open tasks assigned to a user, used for workload balancing
    async fn count_open_for(&self, organization_id: &str, assignee: &str) -> DomainResult<u64>;
}
