use async_trait::async_trait;
use std::collections::HashSet;

use crate::domain::errors::DomainResult;

/// Wildcard permission granting every other permission.
pub const WILDCARD_PERMISSION: &str = "*";

/// Port resolving the permissions held by a principal.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn permissions_for(&self, organization_id: &str, principal: &str) -> DomainResult<HashSet<String>>;
}
