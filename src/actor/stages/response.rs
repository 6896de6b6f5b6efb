//! Drafts the customer-facing reply

use crate::actor::Actor;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, Stage};
use crate::services::generation::{ResponseGenerator, ResponseRequest, TemplateResponseGenerator};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// Never fails: a generator error or overrun degrades to the template reply
///
/// `generation_timeout` must be shorter than the stage timeout, otherwise the
/// runtime gives up on the hop before the template can be used.
pub struct ResponseActor {
    generator: Arc<dyn ResponseGenerator>,
    generation_timeout: Duration,
}

impl ResponseActor {
    pub fn new(generator: Arc<dyn ResponseGenerator>, generation_timeout: Duration) -> Self {
        Self {
            generator,
            generation_timeout,
        }
    }
}

#[async_trait]
impl Actor for ResponseActor {
    fn stage(&self) -> Stage {
        Stage::Response
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        let request = ResponseRequest::from_payload(message.session_id(), &message.payload);

        let generated = timeout(self.generation_timeout, self.generator.generate(&request)).await;
        let (draft, source) = match generated {
            Ok(Ok(draft)) => (draft, self.generator.source()),
            Ok(Err(e)) => {
                warn!(
                    session_id = %request.session_id,
                    error = %e,
                    "Generator failed, using template response"
                );
                (TemplateResponseGenerator::render(&request), "template")
            }
            Err(_) => {
                warn!(
                    session_id = %request.session_id,
                    timeout_ms = self.generation_timeout.as_millis() as u64,
                    "Generator timed out, using template response"
                );
                (TemplateResponseGenerator::render(&request), "template")
            }
        };

        Ok(Enrichment::new()
            .with(keys::DRAFT_RESPONSE, draft)
            .with(keys::RESPONSE_SOURCE, source))
    }
}
