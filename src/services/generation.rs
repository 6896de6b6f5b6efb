//! Customer-facing response drafting

use crate::config::LlmSection;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmError, LlmProvider};
use crate::protocol::messages::{keys, MessagePayload};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// What the generator gets to see of a conversation turn
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRequest {
    pub session_id: String,
    pub text: String,
    pub intent: Option<String>,
    pub sentiment: Option<String>,
    pub customer_context: Option<Value>,
    pub execution_result: Option<Value>,
}

impl ResponseRequest {
    pub fn from_payload<S: Into<String>>(session_id: S, payload: &MessagePayload) -> Self {
        Self {
            session_id: session_id.into(),
            text: payload.text().to_string(),
            intent: payload.intent().map(str::to_string),
            sentiment: payload.sentiment().map(str::to_string),
            customer_context: payload.get(keys::CUSTOMER_CONTEXT).cloned(),
            execution_result: payload.get(keys::EXECUTION_RESULT).cloned(),
        }
    }
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Short label recorded as `response_source`
    fn source(&self) -> &'static str;

    async fn generate(&self, request: &ResponseRequest) -> Result<String, LlmError>;

    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Deterministic replies keyed by intent
#[derive(Debug, Clone, Default)]
pub struct TemplateResponseGenerator;

impl TemplateResponseGenerator {
    pub fn render(request: &ResponseRequest) -> String {
        let opener = match request.sentiment.as_deref() {
            Some("negative") => "I'm sorry for the trouble. ",
            _ => "Thanks for reaching out. ",
        };

        let body = match request.intent.as_deref() {
            Some("refund") => "I've started a refund request for you.",
            Some("cancel_order") => "I've submitted a cancellation request for your order.",
            Some("order_update") => "I've passed your order change along to our fulfilment team.",
            Some("order_status") => {
                "I'm checking on your order and will share tracking details as soon as they're available."
            }
            Some("billing") => "I'm reviewing the charges on your account.",
            Some("shipping") => "I'm looking into the delivery of your package.",
            Some("technical") => "I'm looking into the technical issue you described.",
            Some("account") => "I can help with your account settings.",
            _ => "I've received your message and I'm on it.",
        };

        let reference = request
            .execution_result
            .as_ref()
            .and_then(|result| result.get("reference"))
            .and_then(Value::as_str)
            .map(|reference| format!(" Your reference number is {reference}."))
            .unwrap_or_default();

        format!("{opener}{body}{reference} We'll follow up if we need anything else.")
    }
}

#[async_trait]
impl ResponseGenerator for TemplateResponseGenerator {
    fn source(&self) -> &'static str {
        "template"
    }

    async fn generate(&self, request: &ResponseRequest) -> Result<String, LlmError> {
        Ok(Self::render(request))
    }
}

/// Drafts replies with a chat completion provider
pub struct LlmResponseGenerator {
    provider: Arc<dyn LlmProvider>,
    model: String,
    system_prompt: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl LlmResponseGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, section: &LlmSection) -> Self {
        Self {
            provider,
            model: section.model.clone(),
            system_prompt: section.system_prompt.clone(),
            temperature: section.temperature,
            max_tokens: section.max_tokens,
        }
    }

    /// Prompt for one turn (pure function)
    pub fn build_request(&self, request: &ResponseRequest) -> CompletionRequest {
        let mut details = vec![format!("Customer message: {}", request.text)];
        if let Some(intent) = &request.intent {
            details.push(format!("Detected intent: {intent}"));
        }
        if let Some(sentiment) = &request.sentiment {
            details.push(format!("Detected sentiment: {sentiment}"));
        }
        if let Some(context) = &request.customer_context {
            details.push(format!("Customer profile: {context}"));
        }
        if let Some(result) = &request.execution_result {
            details.push(format!("Action already taken: {result}"));
        }

        let mut completion = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(self.system_prompt.clone()),
                ChatMessage::user(details.join("\n")),
            ],
        );
        completion.temperature = self.temperature;
        completion.max_tokens = self.max_tokens;
        completion
            .metadata
            .insert("session_id".to_string(), request.session_id.clone());
        completion
    }
}

#[async_trait]
impl ResponseGenerator for LlmResponseGenerator {
    fn source(&self) -> &'static str {
        "llm"
    }

    async fn generate(&self, request: &ResponseRequest) -> Result<String, LlmError> {
        let response = self.provider.complete(self.build_request(request)).await?;
        debug!(
            session_id = %request.session_id,
            provider = self.provider.name(),
            tokens = response.usage.total_tokens,
            "Draft generated"
        );

        response
            .content
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("completion had no content".to_string()))
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        self.provider.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatRole;
    use crate::testing::mocks::MockLlmProvider;
    use serde_json::json;

    fn section() -> LlmSection {
        LlmSection {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            system_prompt: "Be helpful.".to_string(),
            temperature: Some(0.2),
            max_tokens: Some(200),
            timeout_ms: None,
        }
    }

    fn refund_request() -> ResponseRequest {
        ResponseRequest {
            session_id: "s-1".to_string(),
            text: "I want my money back".to_string(),
            intent: Some("refund".to_string()),
            sentiment: Some("negative".to_string()),
            customer_context: Some(json!({"tier": "gold"})),
            execution_result: Some(json!({"status": "accepted", "reference": "R-42"})),
        }
    }

    #[test]
    fn test_template_mentions_reference() {
        let text = TemplateResponseGenerator::render(&refund_request());
        assert!(text.starts_with("I'm sorry for the trouble."));
        assert!(text.contains("refund"));
        assert!(text.contains("R-42"));
    }

    #[test]
    fn test_template_without_intent() {
        let request = ResponseRequest {
            intent: None,
            sentiment: None,
            execution_result: None,
            ..refund_request()
        };
        let text = TemplateResponseGenerator::render(&request);
        assert!(text.starts_with("Thanks for reaching out."));
        assert!(!text.contains("reference"));
    }

    #[test]
    fn test_build_request_includes_details() {
        let generator = LlmResponseGenerator::new(Arc::new(MockLlmProvider::new()), &section());
        let completion = generator.build_request(&refund_request());

        assert_eq!(completion.model, "gpt-4o-mini");
        assert_eq!(completion.temperature, Some(0.2));
        assert_eq!(completion.messages[0].role, ChatRole::System);
        let user = &completion.messages[1].content;
        assert!(user.contains("Detected intent: refund"));
        assert!(user.contains("R-42"));
        assert_eq!(completion.metadata.get("session_id").map(String::as_str), Some("s-1"));
    }

    #[tokio::test]
    async fn test_llm_generator_uses_completion() {
        let provider = Arc::new(MockLlmProvider::new().with_response("  Refund on its way.  "));
        let generator = LlmResponseGenerator::new(provider.clone(), &section());

        let text = generator.generate(&refund_request()).await.unwrap();
        assert_eq!(text, "Refund on its way.");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_llm_generator_rejects_empty_completion() {
        let provider = Arc::new(MockLlmProvider::new().with_response("   "));
        let generator = LlmResponseGenerator::new(provider, &section());

        let err = generator.generate(&refund_request()).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
