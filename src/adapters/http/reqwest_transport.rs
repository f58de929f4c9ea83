//! reqwest-backed HTTP transport.

use async_trait::async_trait;
use reqwest::{Client, Method};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::HttpMethod;
use crate::domain::ports::{HttpBody, HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Outbound HTTP through a shared reqwest client. The per-request timeout
/// comes from the request itself.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> DomainResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("conductor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DomainError::Configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(method(request.method), &request.url)
            .timeout(request.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        builder = match &request.body {
            Some(HttpBody::Json(body)) => builder.json(body),
            Some(HttpBody::Form(fields)) => builder.form(fields),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| classify(&e))?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| classify(&e))?;

        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        tracing::debug!(url = %request.url, status, "http request completed");
        Ok(HttpResponse { status, body })
    }
}
