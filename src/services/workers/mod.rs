//! Worker handlers and the registry the dispatcher resolves them from.

pub mod ai;
pub mod external;
pub mod human;
pub mod mapping;
pub mod system;

pub use ai::AiWorker;
pub use external::ExternalWorker;
pub use human::HumanWorker;
pub use system::SystemWorker;

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{PlaybookDefinition, WorkerType};
use crate::domain::ports::WorkerHandler;

/// Registry of handlers keyed by worker type.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    handlers: HashMap<WorkerType, Arc<dyn WorkerHandler>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for its worker type.
    pub fn register(&mut self, handler: Arc<dyn WorkerHandler>) -> &mut Self {
        self.handlers.insert(handler.worker_type(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn WorkerHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, worker_type: WorkerType) -> Option<Arc<dyn WorkerHandler>> {
        self.handlers.get(&worker_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<WorkerType> {
        let mut types: Vec<WorkerType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Reject a definition that uses a worker type with no handler.
    pub fn validate_covers(&self, definition: &PlaybookDefinition) -> DomainResult<()> {
        let missing: Vec<&str> = definition
            .worker_types()
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .map(|t| t.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DomainError::UnknownWorkerType(format!(
                "playbook '{}' uses worker type(s) with no registered handler: {}",
                definition.id,
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::StepError;
    use crate::domain::models::{ExecutionOptions, StepDescriptor, UpstreamContext, WorkerOutput};
    use async_trait::async_trait;

    struct Noop(WorkerType);

    #[async_trait]
    impl WorkerHandler for Noop {
        fn worker_type(&self) -> WorkerType {
            self.0
        }

        async fn execute(
            &self,
            _step: &StepDescriptor,
            _upstream: &UpstreamContext,
            _options: &ExecutionOptions,
        ) -> Result<WorkerOutput, StepError> {
            Ok(WorkerOutput::completed(serde_json::Value::Null))
        }
    }

    const PLAYBOOK: &str = r#"
id: mixed
name: Mixed
steps:
  - id: one
    worker: { type: system, config: { operation: transform, mapping: {} } }
  - id: two
    worker: { type: ai, config: { prompt: "hi" } }
"#;

    #[test]
    fn test_validate_covers() {
        let definition = PlaybookDefinition::from_yaml(PLAYBOOK).unwrap();

        let partial = WorkerRegistry::new().with(Arc::new(Noop(WorkerType::System)));
        let err = partial.validate_covers(&definition).unwrap_err();
        assert!(err.to_string().contains("ai"));

        let full = partial.with(Arc::new(Noop(WorkerType::Ai)));
        assert!(full.validate_covers(&definition).is_ok());
        assert_eq!(full.registered_types(), vec![WorkerType::System, WorkerType::Ai]);
    }
}
