//! Types shared by every worker handler: what a handler receives and what
//! it returns.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::errors::StepError;
use crate::domain::models::definition::WorkerSpec;
use crate::domain::models::idempotency::IdempotencyKey;
use crate::domain::models::step::WorkerType;

/// Everything a handler needs to know about the step it executes.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub organization_id: String,
    pub sequence: u32,
    pub step_definition_id: String,
    pub name: String,
    pub worker: WorkerSpec,
    pub input: serde_json::Value,
    pub attempt: u32,
}

impl StepDescriptor {
    pub fn worker_type(&self) -> WorkerType {
        self.worker.worker_type()
    }
}

/// Outputs of earlier steps and run-level data visible to a handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamContext {
    pub run_input: serde_json::Value,
    pub run_context: serde_json::Value,
    /// Completed step outputs keyed by step definition id, in sequence order
    pub step_outputs: BTreeMap<u32, (String, serde_json::Value)>,
}

impl UpstreamContext {
    /// JSON scope used for templates, mappings, and validation rules:
    /// `run`, `input` (run input), `step` (step input), and `steps`.
    pub fn scope(&self, step: &StepDescriptor) -> serde_json::Value {
        let steps: serde_json::Map<String, serde_json::Value> = self
            .step_outputs
            .values()
            .map(|(id, output)| (id.clone(), output.clone()))
            .collect();

        serde_json::json!({
            "run": {
                "id": step.run_id.to_string(),
                "organization_id": step.organization_id,
                "context": self.run_context,
            },
            "input": self.run_input,
            "step": step.input,
            "steps": steps,
        })
    }

    /// Prior outputs in sequence order, for prompt enrichment.
    pub fn prior_outputs(&self) -> impl Iterator<Item = (&u32, &String, &serde_json::Value)> {
        self.step_outputs.iter().map(|(seq, (id, out))| (seq, id, out))
    }
}

/// Per-invocation options injected by the dispatcher.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub timeout: Duration,
    pub idempotency_key: IdempotencyKey,
    /// Principal the step executes on behalf of
    pub principal: String,
}

/// Identifies the concrete worker that produced an output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub handler: String,
    /// Provider, assignee, or endpoint, depending on the worker
    pub target: Option<String>,
    pub attempts: u32,
    /// HTTP status of the final response, for external calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Successful handler result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub data: serde_json::Value,
    pub worker_info: Option<WorkerInfo>,
    /// The step stays in progress until an external signal completes it
    pub awaiting_signal: bool,
    pub external_ref: Option<String>,
}

impl WorkerOutput {
    pub fn completed(data: serde_json::Value) -> Self {
        Self {
            data,
            worker_info: None,
            awaiting_signal: false,
            external_ref: None,
        }
    }

    pub fn awaiting(data: serde_json::Value, external_ref: impl Into<String>) -> Self {
        Self {
            data,
            worker_info: None,
            awaiting_signal: true,
            external_ref: Some(external_ref.into()),
        }
    }

    pub fn with_worker_info(mut self, info: WorkerInfo) -> Self {
        self.worker_info = Some(info);
        self
    }
}

/// Outcome of one dispatched execution, as seen by the retry manager.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: Result<WorkerOutput, StepError>,
    pub duration_ms: u64,
    /// The result was replayed from a completed idempotency record
    pub replayed: bool,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}
