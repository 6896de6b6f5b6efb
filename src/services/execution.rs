//! Downstream actions for actionable intents (refunds, order updates)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    /// Worth retrying: network failure or server error
    #[error("Action service unavailable: {0}")]
    Unavailable(String),
    #[error("Action rejected: {0}")]
    Rejected(String),
    #[error("Invalid action response: {0}")]
    InvalidResponse(String),
}

impl ExecutionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub intent: String,
    pub text: String,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Perform the action, returning the service's result document
    async fn execute(&self, request: &ActionRequest) -> Result<Value, ExecutionError>;
}

/// Accepts every action locally with a generated reference
#[derive(Debug, Clone, Default)]
pub struct AcceptingActionExecutor;

#[async_trait]
impl ActionExecutor for AcceptingActionExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<Value, ExecutionError> {
        let reference = Uuid::new_v4().to_string();
        info!(
            session_id = %request.session_id,
            action = %request.intent,
            reference = %reference,
            "Action accepted locally"
        );
        Ok(json!({
            "status": "accepted",
            "action": request.intent,
            "reference": reference,
        }))
    }
}

/// Posts actions to `{base_url}/actions/{intent}`
#[derive(Debug, Clone)]
pub struct HttpActionExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpActionExecutor {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute(&self, request: &ActionRequest) -> Result<Value, ExecutionError> {
        let url = format!("{}/actions/{}", self.base_url, request.intent);
        debug!(url = %url, session_id = %request.session_id, "Posting action");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExecutionError::Unavailable(format!(
                "action service returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Rejected(format!("{status}: {body}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ExecutionError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn refund_request() -> ActionRequest {
        ActionRequest {
            session_id: "s-1".to_string(),
            customer_id: Some("c-9".to_string()),
            intent: "refund".to_string(),
            text: "please refund order 1234".to_string(),
        }
    }

    #[tokio::test]
    async fn test_accepting_executor() {
        let result = AcceptingActionExecutor
            .execute(&refund_request())
            .await
            .unwrap();
        assert_eq!(result["status"], "accepted");
        assert_eq!(result["action"], "refund");
        assert!(result["reference"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_http_executor_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/actions/refund"))
            .and(body_partial_json(json!({"session_id": "s-1"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "refunded"})),
            )
            .mount(&server)
            .await;

        let executor = HttpActionExecutor::new(server.uri());
        let result = executor.execute(&refund_request()).await.unwrap();
        assert_eq!(result["status"], "refunded");
    }

    #[tokio::test]
    async fn test_http_executor_error_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/actions/refund"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/actions/cancel_order"))
            .respond_with(ResponseTemplate::new(422).set_body_string("already shipped"))
            .mount(&server)
            .await;

        let executor = HttpActionExecutor::new(server.uri());

        let err = executor.execute(&refund_request()).await.unwrap_err();
        assert!(err.is_transient());

        let mut cancel = refund_request();
        cancel.intent = "cancel_order".to_string();
        let err = executor.execute(&cancel).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("already shipped"));
    }
}
