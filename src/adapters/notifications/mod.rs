//! Notification delivery adapters.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::domain::errors::DomainResult;
use crate::domain::ports::{Notification, Notifier};

/// Delivers notifications to the structured log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> DomainResult<()> {
        tracing::info!(
            organization_id = %notification.organization_id,
            channel = %notification.channel,
            recipients = ?notification.recipients,
            subject = %notification.subject,
            "notification sent"
        );
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct OutboxNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl OutboxNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, notification: &Notification) -> DomainResult<()> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(notification.clone());
        Ok(())
    }
}
