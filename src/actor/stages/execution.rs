//! Carries out actionable intents through the action service

use crate::actor::Actor;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, Stage};
use crate::services::context::ContextStore;
use crate::services::execution::{ActionExecutor, ActionRequest};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ExecutionActor {
    executor: Arc<dyn ActionExecutor>,
    context: Option<Arc<dyn ContextStore>>,
}

impl ExecutionActor {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            executor,
            context: None,
        }
    }

    /// Record each executed action on the customer's cached context
    pub fn with_context_store(mut self, context: Arc<dyn ContextStore>) -> Self {
        self.context = Some(context);
        self
    }

    async fn remember_action(&self, request: &ActionRequest) {
        let (Some(context), Some(customer_id)) = (&self.context, &request.customer_id) else {
            return;
        };
        let updates = json!({
            "last_action": request.intent,
            "last_action_at": Utc::now().to_rfc3339(),
        });
        // The action already happened; a stale cache only costs a later lookup
        if let Err(e) = context.update(customer_id, updates).await {
            warn!(customer_id = %customer_id, error = %e, "Failed to record last action");
        }
    }
}

#[async_trait]
impl Actor for ExecutionActor {
    fn stage(&self) -> Stage {
        Stage::Execution
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        let payload = &message.payload;
        let intent = match payload.intent() {
            Some(intent) if payload.actionable() => intent,
            _ => {
                return Ok(Enrichment::new()
                    .with(keys::EXECUTION_RESULT, json!({"status": "skipped"})))
            }
        };

        let request = ActionRequest {
            session_id: message.session_id().to_string(),
            customer_id: payload.customer_id().map(str::to_string),
            intent: intent.to_string(),
            text: payload.text().to_string(),
        };

        let result = self.executor.execute(&request).await.map_err(|e| {
            StageError::collaborator(Stage::Execution, e.to_string(), e.is_transient())
        })?;
        info!(session_id = %request.session_id, action = %request.intent, "Action executed");
        self.remember_action(&request).await;

        Ok(Enrichment::new().with(keys::EXECUTION_RESULT, result))
    }
}
