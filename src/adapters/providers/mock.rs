//! Offline providers for local runs and tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::domain::errors::StepError;
use crate::domain::ports::{AiProvider, CompletionRequest, CompletionResponse};

/// Provider returning a canned completion that echoes the prompt.
pub struct MockProvider {
    name: String,
    model: String,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, StepError> {
        let excerpt: String = request.prompt.chars().take(120).collect();
        let text = format!("Mock completion for the request: {excerpt}");
        Ok(CompletionResponse {
            input_tokens: request.prompt.split_whitespace().count() as u64,
            output_tokens: text.split_whitespace().count() as u64,
            text,
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            finish_reason: Some("end_turn".to_string()),
        })
    }
}

/// Provider replaying a scripted sequence of outcomes. The last outcome
/// repeats once the script is exhausted.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, StepError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    pub fn fail(self, error: StepError) -> Self {
        self.push(Err(error))
    }

    fn push(self, outcome: Result<String, StepError>) -> Self {
        self.script.lock().unwrap_or_else(|p| p.into_inner()).push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn next_outcome(&self) -> Result<String, StepError> {
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        match script.len() {
            0 => Err(StepError::System(format!("provider {} has no scripted response", self.name))),
            1 => script[0].clone(),
            _ => script
                .pop_front()
                .unwrap_or_else(|| Err(StepError::System("script drained".to_string()))),
        }
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, StepError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let text = self.next_outcome()?;
        Ok(CompletionResponse {
            output_tokens: text.split_whitespace().count() as u64,
            text,
            model: request.model.clone().unwrap_or_else(|| "scripted".to_string()),
            finish_reason: Some("end_turn".to_string()),
            input_tokens: request.prompt.split_whitespace().count() as u64,
        })
    }
}
