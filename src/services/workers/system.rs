//! System worker: deterministic operations run in-process.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::StepError;
use crate::domain::models::{
    ExecutionOptions, StepDescriptor, SystemOperation, UpstreamContext, WorkerInfo, WorkerOutput,
    WorkerSpec, WorkerType,
};
use crate::domain::ports::{Notification, Notifier, RecordStore, WorkerHandler};
use crate::services::workers::mapping::{apply_mapping, render_template, validate_rules};

pub struct SystemWorker {
    records: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl SystemWorker {
    pub fn new(records: Arc<dyn RecordStore>, notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            records,
            notifier,
            timeout,
        }
    }

    async fn run(&self, step: &StepDescriptor, op: &SystemOperation, scope: &serde_json::Value) -> Result<serde_json::Value, StepError> {
        match op {
            SystemOperation::Validate { rules } => {
                validate_rules(rules, scope)?;
                Ok(json!({ "valid": true, "rules_checked": rules.len() }))
            }
            SystemOperation::Transform { mapping } => apply_mapping(mapping, scope),
            SystemOperation::Notify {
                channel,
                recipients,
                subject,
                body,
            } => {
                let recipients = recipients
                    .iter()
                    .map(|r| render_template(r, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let notification = Notification {
                    organization_id: step.organization_id.clone(),
                    channel: channel.clone(),
                    recipients: recipients.clone(),
                    subject: render_template(subject, scope)?,
                    body: render_template(body, scope)?,
                };
                self.notifier.send(&notification).await?;
                Ok(json!({ "notified": recipients, "channel": channel }))
            }
            SystemOperation::CreateRecord { entity_type, fields } => {
                let fields = apply_mapping(fields, scope)?;
                let record_id = self
                    .records
                    .create_record(&step.organization_id, entity_type, fields.clone())
                    .await?;
                Ok(json!({ "record_id": record_id, "entity_type": entity_type, "fields": fields }))
            }
            SystemOperation::UpdateRecord {
                entity_type,
                record_id,
                fields,
            } => {
                let record_id = render_template(record_id, scope)?;
                let fields = apply_mapping(fields, scope)?;
                let updated = self
                    .records
                    .update_record(&step.organization_id, entity_type, &record_id, fields.clone())
                    .await?;
                if !updated {
                    return Err(StepError::execution(format!("{entity_type} record {record_id} not found")));
                }
                Ok(json!({ "record_id": record_id, "entity_type": entity_type, "fields": fields }))
            }
        }
    }
}

fn operation_name(op: &SystemOperation) -> &'static str {
    match op {
        SystemOperation::Validate { .. } => "validate",
        SystemOperation::Transform { .. } => "transform",
        SystemOperation::Notify { .. } => "notify",
        SystemOperation::CreateRecord { .. } => "create_record",
        SystemOperation::UpdateRecord { .. } => "update_record",
    }
}

#[async_trait]
impl WorkerHandler for SystemWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::System
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        upstream: &UpstreamContext,
        _options: &ExecutionOptions,
    ) -> Result<WorkerOutput, StepError> {
        let WorkerSpec::System(op) = &step.worker else {
            return Err(StepError::Validation(format!(
                "system worker cannot execute {} step '{}'",
                step.worker_type(),
                step.name
            )));
        };

        let scope = upstream.scope(step);
        let data = self.run(step, op, &scope).await?;

        Ok(WorkerOutput::completed(data).with_worker_info(WorkerInfo {
            handler: "system".to_string(),
            target: Some(operation_name(op).to_string()),
            attempts: 1,
            status_code: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::DomainResult;
    use crate::domain::models::{IdempotencyKey, RuleCheck, ValidationRule};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Records {
        rows: Mutex<HashMap<String, serde_json::Value>>,
    }

    #[async_trait]
    impl RecordStore for Records {
        async fn create_record(&self, _org: &str, _entity: &str, fields: serde_json::Value) -> DomainResult<String> {
            let id = format!("rec-{}", self.rows.lock().unwrap().len() + 1);
            self.rows.lock().unwrap().insert(id.clone(), fields);
            Ok(id)
        }

        async fn update_record(&self, _org: &str, _entity: &str, id: &str, fields: serde_json::Value) -> DomainResult<bool> {
            let mut rows = self.rows.lock().unwrap();
            if !rows.contains_key(id) {
                return Ok(false);
            }
            rows.insert(id.to_string(), fields);
            Ok(true)
        }

        async fn get_record(&self, _org: &str, _entity: &str, id: &str) -> DomainResult<Option<serde_json::Value>> {
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }
    }

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn send(&self, notification: &Notification) -> DomainResult<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn descriptor(op: SystemOperation) -> StepDescriptor {
        StepDescriptor {
            run_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            organization_id: "org-1".into(),
            sequence: 1,
            step_definition_id: "sys".into(),
            name: "sys".into(),
            worker: WorkerSpec::System(op),
            input: json!({}),
            attempt: 1,
        }
    }

    fn options(step: &StepDescriptor) -> ExecutionOptions {
        ExecutionOptions {
            timeout: Duration::from_secs(5),
            idempotency_key: IdempotencyKey::for_step(step.run_id, step.sequence),
            principal: "system".into(),
        }
    }

    fn upstream(input: serde_json::Value) -> UpstreamContext {
        UpstreamContext {
            run_input: input,
            ..Default::default()
        }
    }

    fn worker() -> (SystemWorker, Arc<Records>, Arc<Outbox>) {
        let records = Arc::new(Records::default());
        let outbox = Arc::new(Outbox::default());
        (
            SystemWorker::new(records.clone(), outbox.clone(), Duration::from_secs(30)),
            records,
            outbox,
        )
    }

    #[tokio::test]
    async fn test_validate_operation() {
        let (worker, _, _) = worker();
        let step = descriptor(SystemOperation::Validate {
            rules: vec![ValidationRule {
                field: "input.email".into(),
                check: RuleCheck::Required,
            }],
        });

        let ok = worker
            .execute(&step, &upstream(json!({"email": "a@b.c"})), &options(&step))
            .await
            .unwrap();
        assert_eq!(ok.data["valid"], json!(true));

        let err = worker.execute(&step, &upstream(json!({})), &options(&step)).await.unwrap_err();
        assert!(matches!(err, StepError::Validation(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_create_and_update_record() {
        let (worker, records, _) = worker();
        let create = descriptor(SystemOperation::CreateRecord {
            entity_type: "vendor".into(),
            fields: BTreeMap::from([("name".to_string(), "{{input.name}}".to_string())]),
        });
        let out = worker
            .execute(&create, &upstream(json!({"name": "Acme"})), &options(&create))
            .await
            .unwrap();
        let record_id = out.data["record_id"].as_str().unwrap().to_string();
        assert_eq!(records.rows.lock().unwrap()[&record_id], json!({"name": "Acme"}));

        let update = descriptor(SystemOperation::UpdateRecord {
            entity_type: "vendor".into(),
            record_id: "{{input.id}}".into(),
            fields: BTreeMap::from([("status".to_string(), "active".to_string())]),
        });
        worker
            .execute(&update, &upstream(json!({"id": record_id})), &options(&update))
            .await
            .unwrap();

        let missing = worker
            .execute(&update, &upstream(json!({"id": "rec-404"})), &options(&update))
            .await;
        assert!(matches!(missing, Err(StepError::Execution { network: false, .. })));
    }

    #[tokio::test]
    async fn test_notify_renders_templates() {
        let (worker, _, outbox) = worker();
        let step = descriptor(SystemOperation::Notify {
            channel: "email".into(),
            recipients: vec!["{{input.owner}}".into()],
            subject: "Vendor {{input.name}} onboarded".into(),
            body: "Done".into(),
        });
        worker
            .execute(&step, &upstream(json!({"owner": "ops@example.com", "name": "Acme"})), &options(&step))
            .await
            .unwrap();

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Vendor Acme onboarded");
        assert_eq!(sent[0].recipients, vec!["ops@example.com".to_string()]);
    }
}
