use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::PlaybookDefinition;

/// Repository port for playbook definitions
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Insert or replace a definition by id
    async fn upsert(&self, definition: &PlaybookDefinition) -> DomainResult<()>;

    async fn get(&self, id: &str) -> DomainResult<Option<PlaybookDefinition>>;

    /// Definitions visible to an organization, including global ones
    async fn list_for_organization(&self, organization_id: &str) -> DomainResult<Vec<PlaybookDefinition>>;
}
