use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Port to the generic business record store.
///
/// The orchestration engine only creates and updates records on behalf of
/// system steps; the schema of each entity type belongs to the store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record and return its id
    async fn create_record(
        &self,
        organization_id: &str,
        entity_type: &str,
        fields: serde_json::Value,
    ) -> DomainResult<String>;

    /// Merge fields into an existing record; returns `false` when it does not exist
    async fn update_record(
        &self,
        organization_id: &str,
        entity_type: &str,
        record_id: &str,
        fields: serde_json::Value,
    ) -> DomainResult<bool>;

    async fn get_record(
        &self,
        organization_id: &str,
        entity_type: &str,
        record_id: &str,
    ) -> DomainResult<Option<serde_json::Value>>;
}
