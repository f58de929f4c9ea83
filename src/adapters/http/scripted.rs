//! Scripted HTTP transport for tests and dry runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::domain::ports::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Replays scripted responses in order; the last one repeats. Every request
/// is recorded.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(self, status: u16, body: serde_json::Value) -> Self {
        self.push(Ok(HttpResponse { status, body }))
    }

    pub fn error(self, error: TransportError) -> Self {
        self.push(Err(error))
    }

    fn push(self, outcome: Result<HttpResponse, TransportError>) -> Self {
        self.script.lock().unwrap_or_else(|p| p.into_inner()).push_back(outcome);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).push(request);

        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        match script.len() {
            0 => Err(TransportError::Other("no scripted response".to_string())),
            1 => script[0].clone(),
            _ => script
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script drained".to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::HttpMethod;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_replays_in_order_then_repeats_last() {
        let transport = ScriptedTransport::new()
            .error(TransportError::Timeout)
            .status(200, json!({"ok": true}));
        let request = || HttpRequest::new(HttpMethod::Get, "https://example.com", Duration::from_secs(1));

        assert_eq!(transport.send(request()).await, Err(TransportError::Timeout));
        assert_eq!(transport.send(request()).await.unwrap().status, 200);
        assert_eq!(transport.send(request()).await.unwrap().status, 200);
        assert_eq!(transport.requests().len(), 3);
    }
}
