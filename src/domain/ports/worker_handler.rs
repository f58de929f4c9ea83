use async_trait::async_trait;
use std::time::Duration;

use crate::domain::errors::StepError;
use crate::domain::models::{
    ExecutionOptions, StepDescriptor, UpstreamContext, WorkerOutput, WorkerType,
};

/// Contract shared by every worker implementation.
///
/// Handlers must honour `options.timeout` for blocking I/O; the dispatcher
/// additionally races every invocation against the same deadline.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    /// Worker type this handler executes.
    fn worker_type(&self) -> WorkerType;

    /// Upper bound on execution time regardless of the dispatcher default.
    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        upstream: &UpstreamContext,
        options: &ExecutionOptions,
    ) -> Result<WorkerOutput, StepError>;
}
