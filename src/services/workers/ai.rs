//! AI worker: prompt assembly, provider fallback, and confidence scoring.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::domain::errors::StepError;
use crate::domain::models::{
    AiStepConfig, ExecutionOptions, ResponseFormat, StepDescriptor, UpstreamContext, WorkerInfo, WorkerOutput,
    WorkerSpec, WorkerType,
};
use crate::domain::ports::{AiProvider, CompletionRequest, CompletionResponse, WorkerHandler};
use crate::services::workers::mapping::render_template;

const JSON_INSTRUCTION: &str = "Respond with a single JSON object and nothing else.";

const HEDGES: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "cannot determine",
    "can't determine",
    "unclear",
    "i don't know",
    "insufficient information",
];

pub struct AiWorker {
    primary: Arc<dyn AiProvider>,
    fallback: Option<Arc<dyn AiProvider>>,
}

/// Build the user prompt: the rendered template, optionally followed by
/// prior step outputs in sequence order.
pub fn assemble_prompt(
    config: &AiStepConfig,
    step: &StepDescriptor,
    upstream: &UpstreamContext,
) -> Result<String, StepError> {
    let mut prompt = render_template(&config.prompt, &upstream.scope(step))?;

    if config.include_prior_outputs {
        let mut outputs = upstream.prior_outputs().peekable();
        if outputs.peek().is_some() {
            prompt.push_str("\n\nOutputs of previous steps:");
            for (sequence, id, output) in outputs {
                prompt.push_str(&format!("\n- step {sequence} ({id}): {output}"));
            }
        }
    }
    Ok(prompt)
}

/// Strip a fenced code block around a JSON payload.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Heuristic confidence in [0, 1] from response characteristics.
pub fn confidence_score(response: &CompletionResponse, json_requested: bool, json_parsed: bool, used_fallback: bool) -> f64 {
    let text = response.text.trim();
    if text.is_empty() {
        return 0.0;
    }

    let mut score: f64 = 1.0;
    if response.finish_reason.as_deref() == Some("max_tokens") {
        score -= 0.3;
    }
    if text.chars().count() < 20 {
        score -= 0.2;
    }
    let lower = text.to_lowercase();
    if HEDGES.iter().any(|h| lower.contains(h)) {
        score -= 0.2;
    }
    if json_requested && !json_parsed {
        score -= 0.4;
    }
    if used_fallback {
        score -= 0.1;
    }
    score.clamp(0.0, 1.0)
}

impl AiWorker {
    pub fn new(primary: Arc<dyn AiProvider>, fallback: Option<Arc<dyn AiProvider>>) -> Self {
        Self { primary, fallback }
    }

    async fn complete(
        &self,
        step: &StepDescriptor,
        request: &CompletionRequest,
    ) -> Result<(CompletionResponse, &str, bool), StepError> {
        let primary_err = match self.primary.complete(request).await {
            Ok(response) => return Ok((response, self.primary.name(), false)),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return Err(primary_err);
        };

        tracing::warn!(
            run_id = %step.run_id,
            step_id = %step.step_id,
            primary = self.primary.name(),
            fallback = fallback.name(),
            error = %primary_err,
            "primary AI provider failed; using fallback"
        );
        let response = fallback.complete(request).await?;
        Ok((response, fallback.name(), true))
    }
}

#[async_trait]
impl WorkerHandler for AiWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Ai
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        upstream: &UpstreamContext,
        _options: &ExecutionOptions,
    ) -> Result<WorkerOutput, StepError> {
        let WorkerSpec::Ai(config) = &step.worker else {
            return Err(StepError::Validation(format!(
                "AI worker cannot execute {} step '{}'",
                step.worker_type(),
                step.name
            )));
        };

        let json_requested = config.response_format == ResponseFormat::Json;
        let scope = upstream.scope(step);
        let mut system_prompt = config
            .system_prompt
            .as_ref()
            .map(|s| render_template(s, &scope))
            .transpose()?;
        if json_requested {
            system_prompt = Some(match system_prompt {
                Some(s) => format!("{s}\n\n{JSON_INSTRUCTION}"),
                None => JSON_INSTRUCTION.to_string(),
            });
        }

        let request = CompletionRequest {
            system_prompt,
            prompt: assemble_prompt(config, step, upstream)?,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };

        let (response, provider, used_fallback) = self.complete(step, &request).await?;

        let parsed = json_requested
            .then(|| serde_json::from_str::<serde_json::Value>(strip_fences(&response.text)).ok())
            .flatten();
        let confidence = confidence_score(&response, json_requested, parsed.is_some(), used_fallback);
        let needs_review = config.min_confidence.is_some_and(|min| confidence < min);

        tracing::debug!(
            run_id = %step.run_id,
            step_id = %step.step_id,
            provider,
            model = %response.model,
            confidence,
            needs_review,
            "AI step completed"
        );

        let data = json!({
            "text": response.text,
            "parsed": parsed,
            "model": response.model,
            "provider": provider,
            "confidence": confidence,
            "needs_review": needs_review,
            "usage": {
                "input_tokens": response.input_tokens,
                "output_tokens": response.output_tokens,
            },
        });

        Ok(WorkerOutput::completed(data).with_worker_info(WorkerInfo {
            handler: "ai".to_string(),
            target: Some(provider.to_string()),
            attempts: if used_fallback { 2 } else { 1 },
            status_code: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::providers::ScriptedProvider;
    use crate::domain::models::IdempotencyKey;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn config(format: ResponseFormat) -> AiStepConfig {
        AiStepConfig {
            prompt: "Summarize vendor {{input.vendor}}".into(),
            system_prompt: None,
            include_prior_outputs: true,
            model: None,
            max_tokens: None,
            temperature: None,
            response_format: format,
            min_confidence: Some(0.7),
        }
    }

    fn descriptor(config: AiStepConfig) -> StepDescriptor {
        StepDescriptor {
            run_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            organization_id: "org-1".into(),
            sequence: 3,
            step_definition_id: "summarize".into(),
            name: "summarize".into(),
            worker: WorkerSpec::Ai(config),
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

    fn upstream() -> UpstreamContext {
        UpstreamContext {
            run_input: json!({"vendor": "Acme"}),
            run_context: json!({}),
            step_outputs: BTreeMap::from([(1, ("lookup".to_string(), json!({"rating": "A"})))]),
        }
    }

    #[test]
    fn test_prompt_includes_prior_outputs() {
        let step = descriptor(config(ResponseFormat::Text));
        let WorkerSpec::Ai(cfg) = &step.worker else { unreachable!() };
        let prompt = assemble_prompt(cfg, &step, &upstream()).unwrap();
        assert!(prompt.starts_with("Summarize vendor Acme"));
        assert!(prompt.contains("step 1 (lookup): {\"rating\":\"A\"}"));

        let mut without = cfg.clone();
        without.include_prior_outputs = false;
        assert_eq!(assemble_prompt(&without, &step, &upstream()).unwrap(), "Summarize vendor Acme");
    }

    #[test]
    fn test_confidence_heuristics() {
        let response = |text: &str, finish: &str| CompletionResponse {
            text: text.into(),
            model: "m".into(),
            finish_reason: Some(finish.into()),
            input_tokens: 1,
            output_tokens: 1,
        };
        let solid = response("Acme is a long-standing supplier with an A rating.", "end_turn");
        assert_eq!(confidence_score(&solid, false, false, false), 1.0);

        let truncated = response("Acme is a long-standing supplier with an A rating.", "max_tokens");
        assert!(confidence_score(&truncated, false, false, false) < 0.8);

        let hedged = response("I'm not sure about this vendor's history at all.", "end_turn");
        assert!(confidence_score(&hedged, false, false, false) < 1.0);

        assert_eq!(confidence_score(&response("   ", "end_turn"), false, false, false), 0.0);
    }

    #[tokio::test]
    async fn test_parses_json_when_requested() {
        let provider = Arc::new(ScriptedProvider::new("primary").respond("```json\n{\"risk\": \"low\"}\n```"));
        let worker = AiWorker::new(provider, None);
        let step = descriptor(config(ResponseFormat::Json));

        let out = worker.execute(&step, &upstream(), &options(&step)).await.unwrap();
        assert_eq!(out.data["parsed"], json!({"risk": "low"}));
        assert_eq!(out.data["provider"], json!("primary"));
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_fails() {
        let primary = Arc::new(ScriptedProvider::new("primary").fail(StepError::network("overloaded")));
        let fallback = Arc::new(
            ScriptedProvider::new("fallback").respond("Acme is a reliable vendor with strong delivery history."),
        );
        let worker = AiWorker::new(primary.clone(), Some(fallback.clone()));
        let step = descriptor(config(ResponseFormat::Text));

        let out = worker.execute(&step, &upstream(), &options(&step)).await.unwrap();
        assert_eq!(out.data["provider"], json!("fallback"));
        assert_eq!(out.worker_info.unwrap().attempts, 2);
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
        assert!(fallback.requests()[0].prompt.contains("Summarize vendor Acme"));
    }

    #[tokio::test]
    async fn test_primary_error_without_fallback() {
        let primary = Arc::new(ScriptedProvider::new("primary").fail(StepError::network("down")));
        let worker = AiWorker::new(primary, None);
        let step = descriptor(config(ResponseFormat::Text));

        let err = worker.execute(&step, &upstream(), &options(&step)).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_low_confidence_flags_review() {
        let provider = Arc::new(ScriptedProvider::new("primary").respond("unclear"));
        let worker = AiWorker::new(provider, None);
        let step = descriptor(config(ResponseFormat::Text));

        let out = worker.execute(&step, &upstream(), &options(&step)).await.unwrap();
        assert_eq!(out.data["needs_review"], json!(true));
    }
}
