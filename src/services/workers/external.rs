//! External worker: authenticated HTTP calls with transient-fault retries,
//! response validation, and declarative output mapping.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::domain::errors::StepError;
use crate::domain::models::{
    AuthConfig, ExecutionOptions, ExternalRetryPolicy, ExternalStepConfig, HttpMethod, StepDescriptor,
    UpstreamContext, WorkerInfo, WorkerOutput, WorkerSpec, WorkerType,
};
use crate::domain::ports::{HttpRequest, HttpResponse, HttpTransport, TransportError, WorkerHandler};
use crate::services::workers::mapping::{render_template, render_value, resolve_path, validate_rules};

/// Tokens are refreshed this long before the provider-reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Why the last attempt of a call failed.
#[derive(Debug)]
enum CallFailure {
    Status(HttpResponse),
    Transport(TransportError),
}

pub struct ExternalWorker {
    transport: Arc<dyn HttpTransport>,
    default_timeout: Duration,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

fn status_error(response: &HttpResponse, attempts: u32) -> StepError {
    let message = format!("HTTP {} after {attempts} attempt(s): {}", response.status, response.body);
    if response.is_transient() {
        StepError::network(message)
    } else {
        StepError::execution(message)
    }
}

fn transport_error(error: TransportError, attempts: u32) -> StepError {
    match error {
        TransportError::InvalidRequest(msg) => StepError::Validation(msg),
        other => StepError::network(format!("{other} after {attempts} attempt(s)")),
    }
}

impl ExternalWorker {
    pub fn new(transport: Arc<dyn HttpTransport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            default_timeout,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Send with exponential backoff on transient failures.
    ///
    /// Returns the final response and the number of attempts made.
    async fn send_with_retry(
        &self,
        request: &HttpRequest,
        policy: &ExternalRetryPolicy,
    ) -> (Result<HttpResponse, CallFailure>, u32) {
        let max_attempts = policy.max_attempts.max(1);
        let schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(policy.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(policy.max_backoff_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let transport = &self.transport;

        let result = backoff::future::retry(schedule, move || {
            let request = request.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let retryable = attempt < max_attempts;
                match transport.send(request).await {
                    Ok(response) if response.is_transient() => {
                        tracing::debug!(status = response.status, attempt, "transient HTTP status");
                        let failure = CallFailure::Status(response);
                        Err(if retryable {
                            backoff::Error::transient(failure)
                        } else {
                            backoff::Error::permanent(failure)
                        })
                    }
                    Ok(response) => Ok(response),
                    Err(e) => {
                        tracing::debug!(error = %e, attempt, "HTTP transport failure");
                        let transient = e.is_transient();
                        let failure = CallFailure::Transport(e);
                        Err(if retryable && transient {
                            backoff::Error::transient(failure)
                        } else {
                            backoff::Error::permanent(failure)
                        })
                    }
                }
            }
        })
        .await;

        (result, attempts.load(Ordering::SeqCst))
    }

    fn token_cache_key(token_url: &str, client_id: &str) -> String {
        format!("{token_url}#{client_id}")
    }

    /// Client-credentials token, served from cache until shortly before expiry.
    async fn oauth2_token(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
        timeout: Duration,
    ) -> Result<String, StepError> {
        let key = Self::token_cache_key(token_url, client_id);
        let cached = self
            .tokens
            .lock()
            .await
            .get(&key)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.access_token.clone());
        if let Some(access_token) = cached {
            return Ok(access_token);
        }

        // The cache is not held across the fetch; concurrent refreshes of
        // one client may both fetch and the last insert wins.

        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), client_id.to_string()),
            ("client_secret".to_string(), client_secret.to_string()),
        ];
        if let Some(scope) = scope {
            form.push(("scope".to_string(), scope.to_string()));
        }
        let request = HttpRequest::new(HttpMethod::Post, token_url, timeout).form(form);
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| transport_error(e, 1))?;
        if !response.is_success() {
            return Err(status_error(&response, 1));
        }

        let access_token = response
            .body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepError::execution("token response has no access_token"))?
            .to_string();
        let lifetime = response
            .body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .map_or(DEFAULT_TOKEN_LIFETIME, Duration::from_secs);

        self.tokens.lock().await.insert(
            key,
            CachedToken {
                access_token: access_token.clone(),
                expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
            },
        );
        Ok(access_token)
    }

    async fn authenticate(
        &self,
        mut request: HttpRequest,
        auth: Option<&AuthConfig>,
    ) -> Result<HttpRequest, StepError> {
        match auth {
            None => {}
            Some(AuthConfig::Bearer { token }) => {
                request = request.header("Authorization", format!("Bearer {}", token.resolve()?));
            }
            Some(AuthConfig::Basic { username, password }) => {
                request.basic_auth = Some((username.clone(), password.resolve()?));
            }
            Some(AuthConfig::ApiKey { header, key }) => {
                request = request.header(header.clone(), key.resolve()?);
            }
            Some(AuthConfig::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            }) => {
                let token = self
                    .oauth2_token(
                        token_url,
                        client_id,
                        &client_secret.resolve()?,
                        scope.as_deref(),
                        request.timeout,
                    )
                    .await?;
                request = request.header("Authorization", format!("Bearer {token}"));
            }
        }
        Ok(request)
    }

    async fn evict_token(&self, auth: Option<&AuthConfig>) {
        if let Some(AuthConfig::OAuth2 { token_url, client_id, .. }) = auth {
            self.tokens
                .lock()
                .await
                .remove(&Self::token_cache_key(token_url, client_id));
        }
    }
}

/// Project the response body through the configured mapping.
fn map_response(config: &ExternalStepConfig, body: &serde_json::Value) -> Result<serde_json::Value, StepError> {
    if config.response_mapping.is_empty() {
        return Ok(body.clone());
    }
    let mut out = serde_json::Map::new();
    for (field, path) in &config.response_mapping {
        let value = resolve_path(body, path)
            .ok_or_else(|| StepError::Validation(format!("response has no value at '{path}' for '{field}'")))?;
        out.insert(field.clone(), value.clone());
    }
    Ok(serde_json::Value::Object(out))
}

#[async_trait]
impl WorkerHandler for ExternalWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::External
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        upstream: &UpstreamContext,
        options: &ExecutionOptions,
    ) -> Result<WorkerOutput, StepError> {
        let WorkerSpec::External(config) = &step.worker else {
            return Err(StepError::Validation(format!(
                "external worker cannot execute {} step '{}'",
                step.worker_type(),
                step.name
            )));
        };

        let scope = upstream.scope(step);
        let timeout = config
            .timeout_secs
            .map_or(self.default_timeout, Duration::from_secs)
            .min(options.timeout);

        let mut request = HttpRequest::new(config.method, render_template(&config.url, &scope)?, timeout)
            .header("Idempotency-Key", options.idempotency_key.as_str());
        for (name, value) in &config.headers {
            request = request.header(name.clone(), render_template(value, &scope)?);
        }
        if let Some(body) = &config.body {
            request = request.json(render_value(body, &scope)?);
        }
        let request = self.authenticate(request, config.auth.as_ref()).await?;

        let span = tracing::info_span!(
            "external_call",
            run_id = %step.run_id,
            step_id = %step.step_id,
            method = config.method.as_str(),
            url = %request.url,
        );
        let (result, attempts) = self
            .send_with_retry(&request, &config.retry)
            .instrument(span)
            .await;
        let response = match result {
            Ok(response) => response,
            Err(CallFailure::Status(response)) => return Err(status_error(&response, attempts)),
            Err(CallFailure::Transport(e)) => return Err(transport_error(e, attempts)),
        };

        if response.status == 401 {
            self.evict_token(config.auth.as_ref()).await;
        }
        let accepted = if config.expected_status.is_empty() {
            response.is_success()
        } else {
            config.expected_status.contains(&response.status)
        };
        if !accepted {
            return Err(status_error(&response, attempts));
        }

        validate_rules(&config.validation, &response.body)?;
        let data = map_response(config, &response.body)?;

        tracing::info!(
            run_id = %step.run_id,
            step_id = %step.step_id,
            status = response.status,
            attempts,
            "external call succeeded"
        );

        Ok(WorkerOutput::completed(data).with_worker_info(WorkerInfo {
            handler: "external".to_string(),
            target: Some(request.url.clone()),
            attempts,
            status_code: Some(response.status),
        }))
    }
}
