use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub organization_id: String,
    pub channel: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Port for delivering notifications (email, chat, in-app).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> DomainResult<()>;
}
