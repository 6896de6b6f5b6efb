//! Customer profile lookup

use crate::actor::Actor;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, Stage};
use crate::services::context::{ContextLookup, ContextStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct ContextActor {
    store: Arc<dyn ContextStore>,
}

impl ContextActor {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self { store }
    }

    /// Customer id when the gateway supplied one, otherwise the session id
    fn customer_key(message: &Message) -> &str {
        message
            .payload
            .customer_id()
            .unwrap_or_else(|| message.session_id())
    }
}

#[async_trait]
impl Actor for ContextActor {
    fn stage(&self) -> Stage {
        Stage::Context
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        let key = Self::customer_key(message);
        match self.store.lookup(key).await {
            ContextLookup::Found(context) => Ok(Enrichment::new()
                .with(keys::CUSTOMER_CONTEXT, context)
                .with(keys::CONTEXT_STATUS, "found")),
            ContextLookup::NotFound => {
                debug!(customer_key = %key, "No customer context, proceeding without it");
                Ok(Enrichment::new().with(keys::CONTEXT_STATUS, "not_found"))
            }
            ContextLookup::Error(cause) => Err(StageError::transient(Stage::Context, cause)),
        }
    }
}
