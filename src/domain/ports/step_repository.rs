use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{StepInstance, StepStatus};

/// Repository port for step instance persistence
#[async_trait]
pub trait StepRepository: Send + Sync {
    /// Insert all steps of a newly created run
    async fn create_many(&self, steps: &[StepInstance]) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<StepInstance>>;

    /// All steps of a run ordered by sequence number
    async fn list_for_run(&self, run_id: Uuid) -> DomainResult<Vec<StepInstance>>;

    /// Steps in a given status across runs
    async fn list_by_status(&self, status: StepStatus) -> DomainResult<Vec<StepInstance>>;

    /// Persist the step. Fails with `ConcurrencyConflict` when the stored
    /// status cannot precede `step.status`, meaning another coordinator
    /// moved the step since it was read.
    async fn update(&self, step: &StepInstance) -> DomainResult<()>;

    /// Compare-and-set `pending -> in_progress` with a lease.
    ///
    /// Returns `false` when the step was no longer pending, meaning another
    /// coordinator claimed it first.
    async fn try_claim(
        &self,
        step_id: Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> DomainResult<bool>;
}
