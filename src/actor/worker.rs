//! Consumer loops between the bus and the stage logic
//!
//! The [`Dispatcher`] drains the transport's inbound channel and fans each
//! delivery out to the queue for its subject. Every stage runs `concurrency`
//! workers sharing one queue; a worker acknowledges a delivery only once its
//! outcome has been published, so a crash before that point means redelivery.

use super::aggregator::ResponseAggregator;
use super::contract::HopOutcome;
use super::runtime::{publish_outcome, ActorRuntime};
use crate::error::MeshError;
use crate::gateway::{Gateway, SessionDelivery};
use crate::observability::metrics::metrics;
use crate::protocol::{DeadLetter, Message, Route, RouteError, Stage};
use crate::services::audit::AuditStore;
use crate::transport::{AckToken, InboundDelivery, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Work queue shared by the competing workers of one subject
pub type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<InboundDelivery>>>;

/// New queue for one subject
pub fn work_queue() -> (mpsc::UnboundedSender<InboundDelivery>, SharedQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Arc::new(Mutex::new(rx)))
}

/// Anything that consumes decoded messages for one stage
#[async_trait]
pub trait StageWorker: Send + Sync {
    fn stage(&self) -> Stage;

    /// `Ok` once the message's successor is on the bus and the inbound
    /// delivery may be acknowledged
    async fn work(&self, message: Message) -> Result<(), MeshError>;
}

#[async_trait]
impl<T: Transport> StageWorker for ActorRuntime<T> {
    fn stage(&self) -> Stage {
        ActorRuntime::stage(self)
    }

    async fn work(&self, message: Message) -> Result<(), MeshError> {
        let outcome = self.process(message).await?;
        debug!(outcome = outcome.label(), "Hop published");
        Ok(())
    }
}

#[async_trait]
impl<A, D, T> StageWorker for ResponseAggregator<A, D, T>
where
    A: AuditStore,
    D: SessionDelivery,
    T: Transport,
{
    fn stage(&self) -> Stage {
        Stage::Aggregator
    }

    async fn work(&self, message: Message) -> Result<(), MeshError> {
        self.process(message).await.map(|_| ())
    }
}

/// Decode an inbound body, classifying failures as dead letters
pub fn parse_message(stage: Stage, body: &[u8]) -> Result<Message, DeadLetter> {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            let error = MeshError::malformed(format!("Body is not JSON: {e}"));
            let raw = Value::String(String::from_utf8_lossy(body).into_owned());
            return Err(error.to_dead_letter(Some(stage), None, None, raw));
        }
    };

    match serde_json::from_value::<Message>(value.clone()) {
        Ok(message) => Ok(message),
        Err(e) => {
            let error = classify_decode_failure(&value, e);
            let message_id = value
                .get("id")
                .and_then(Value::as_str)
                .and_then(|id| Uuid::parse_str(id).ok());
            let session_id = value
                .pointer("/metadata/session_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            Err(error.to_dead_letter(Some(stage), message_id, session_id, value))
        }
    }
}

/// A route that is wrong on its own is an invalid route, anything else is malformed
fn classify_decode_failure(value: &Value, error: serde_json::Error) -> MeshError {
    match value.get("route").and_then(route_from_value) {
        Some(Err(route_error)) => MeshError::InvalidRoute(route_error),
        _ => MeshError::malformed(error.to_string()),
    }
}

/// `None` when the value is not even shaped like a route
fn route_from_value(route: &Value) -> Option<Result<Route, RouteError>> {
    let stages = route.get("stages")?.as_array()?;
    let cursor = usize::try_from(route.get("cursor")?.as_u64()?).ok()?;
    let stages = stages
        .iter()
        .map(|stage| stage.as_str().unwrap_or_default().parse::<Stage>())
        .collect::<Result<Vec<_>, _>>();
    Some(stages.and_then(|stages| Route::new(stages, cursor)))
}

/// Process one delivery; returns whether it was acknowledged
pub async fn handle_delivery<T: Transport + ?Sized>(
    worker: &dyn StageWorker,
    transport: &T,
    delivery: InboundDelivery,
) -> bool {
    metrics().message_received();
    let stage = worker.stage();

    let handled = match parse_message(stage, &delivery.payload) {
        Ok(message) => worker.work(message).await,
        Err(letter) => {
            warn!(
                stage = stage.as_str(),
                code = ?letter.code,
                reason = %letter.reason,
                "Dead-lettering unreadable body"
            );
            publish_outcome(transport, &HopOutcome::DeadLetter(letter)).await
        }
    };

    match handled {
        Ok(()) => acknowledge(transport, delivery.ack).await,
        Err(e) => {
            // Left unacknowledged, the broker redelivers
            error!(stage = stage.as_str(), error = %e, "Hop not completed");
            false
        }
    }
}

async fn acknowledge<T: Transport + ?Sized>(transport: &T, token: AckToken) -> bool {
    match transport.acknowledge(token).await {
        Ok(()) => true,
        Err(e) => {
            warn!(ack = token.0, error = %e, "Acknowledgement failed");
            false
        }
    }
}

/// Consume a shared queue until every sender is gone
pub async fn run_worker<T: Transport + ?Sized>(
    worker: Arc<dyn StageWorker>,
    transport: Arc<T>,
    queue: SharedQueue,
) {
    let stage = worker.stage();
    debug!(stage = stage.as_str(), "Worker started");

    loop {
        let delivery = {
            let mut receiver = queue.lock().await;
            receiver.recv().await
        };
        let Some(delivery) = delivery else {
            break;
        };
        handle_delivery(worker.as_ref(), transport.as_ref(), delivery).await;
    }

    debug!(stage = stage.as_str(), "Worker stopped");
}

/// Push delivery records from the bus to live sessions
///
/// Records are already persisted, so every body is acknowledged whether or not
/// a session was waiting for it.
pub async fn run_delivery_forwarder<T: Transport>(gateway: Arc<Gateway<T>>, transport: Arc<T>, queue: SharedQueue) {
    loop {
        let delivery = {
            let mut receiver = queue.lock().await;
            receiver.recv().await
        };
        let Some(delivery) = delivery else {
            break;
        };
        metrics().message_received();
        if let Err(e) = gateway.forward_body(&delivery.payload).await {
            warn!(error = %e, "Discarding unreadable delivery record");
        }
        acknowledge(transport.as_ref(), delivery.ack).await;
    }
}

/// Routes inbound deliveries to per-subject queues
///
/// Queues are unbounded so a slow stage never blocks the transport's event
/// loop, which also carries the acknowledgements that drain them.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    routes: HashMap<String, mpsc::UnboundedSender<InboundDelivery>>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            routes: HashMap::new(),
        }
    }

    /// Create the queue for a subject
    pub fn register<S: Into<String>>(&mut self, subject: S) -> SharedQueue {
        let (tx, queue) = work_queue();
        self.routes.insert(subject.into(), tx);
        queue
    }

    pub fn subjects(&self) -> impl Iterator<Item = &String> {
        self.routes.keys()
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<InboundDelivery>) {
        info!(subjects = self.routes.len(), "Dispatcher started");

        while let Some(delivery) = inbound.recv().await {
            match self.routes.get(&delivery.subject) {
                Some(queue) => {
                    if let Err(mpsc::error::SendError(delivery)) = queue.send(delivery) {
                        // Workers are gone; leave it for redelivery
                        warn!(subject = %delivery.subject, "No worker left for subject");
                    }
                }
                None => {
                    warn!(subject = %delivery.subject, "Dropping delivery on unknown subject");
                    acknowledge(self.transport.as_ref(), delivery.ack).await;
                }
            }
        }

        info!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::contract::Actor;
    use crate::protocol::{keys, subject_for, DeadLetterCode, Enrichment};
    use crate::routing::{DecisionPolicy, DecisionRouter, EscalationPolicy, EscalationRouter};
    use crate::testing::mocks::{MockTransport, StaticActor};
    use crate::actor::runtime::RuntimeSettings;
    use serde_json::json;
    use std::time::Duration;

    fn sentiment_worker(transport: Arc<MockTransport>) -> Arc<dyn StageWorker> {
        let actor: Arc<dyn Actor> = Arc::new(StaticActor::new(
            Stage::Sentiment,
            Enrichment::new().with(keys::SENTIMENT, "neutral"),
        ));
        Arc::new(ActorRuntime::new(
            actor,
            transport,
            DecisionRouter::new(DecisionPolicy::default()),
            EscalationRouter::new(EscalationPolicy::default()),
            RuntimeSettings::default(),
        ))
    }

    fn delivery(body: Vec<u8>, ack: u64) -> InboundDelivery {
        InboundDelivery {
            subject: subject_for(Stage::Sentiment).to_string(),
            payload: body,
            ack: AckToken(ack),
        }
    }

    #[test]
    fn test_parse_valid_message() {
        let message = Message::new("s-1", "hi");
        let body = serde_json::to_vec(&message).unwrap();
        assert_eq!(parse_message(Stage::Sentiment, &body).unwrap(), message);
    }

    #[test]
    fn test_non_json_is_malformed() {
        let letter = parse_message(Stage::Intent, b"\xff not json").unwrap_err();
        assert_eq!(letter.code, DeadLetterCode::MalformedMessage);
        assert_eq!(letter.stage, Some(Stage::Intent));
        assert!(letter.message_id.is_none());
    }

    #[test]
    fn test_bad_cursor_is_invalid_route() {
        let mut value = serde_json::to_value(Message::new("s-1", "hi")).unwrap();
        value["route"]["cursor"] = json!(99);

        let letter = parse_message(Stage::Sentiment, &serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert_eq!(letter.code, DeadLetterCode::InvalidRoute);
        assert_eq!(letter.session_id.as_deref(), Some("s-1"));
        assert!(letter.message_id.is_some());
    }

    #[test]
    fn test_unknown_stage_is_invalid_route() {
        let mut value = serde_json::to_value(Message::new("s-1", "hi")).unwrap();
        value["route"]["stages"] = json!(["sentiment", "billing"]);

        let letter = parse_message(Stage::Sentiment, &serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert_eq!(letter.code, DeadLetterCode::InvalidRoute);
    }

    #[test]
    fn test_payload_only_body_is_malformed() {
        let body = serde_json::to_vec(&json!({"text": "hello"})).unwrap();
        let letter = parse_message(Stage::Sentiment, &body).unwrap_err();
        assert_eq!(letter.code, DeadLetterCode::MalformedMessage);
    }

    #[tokio::test]
    async fn test_ack_after_publish() {
        let transport = Arc::new(MockTransport::new());
        let worker = sentiment_worker(transport.clone());
        let body = serde_json::to_vec(&Message::new("s-1", "hi")).unwrap();

        assert!(handle_delivery(worker.as_ref(), transport.as_ref(), delivery(body, 7)).await);
        assert_eq!(transport.get_messages_on(subject_for(Stage::Intent)).await.len(), 1);
        assert_eq!(transport.get_acknowledged().await, vec![AckToken(7)]);
    }

    #[tokio::test]
    async fn test_no_ack_when_publish_fails() {
        let transport = Arc::new(MockTransport::new());
        transport.set_publish_failure(true);
        let worker = sentiment_worker(transport.clone());
        let body = serde_json::to_vec(&Message::new("s-1", "hi")).unwrap();

        assert!(!handle_delivery(worker.as_ref(), transport.as_ref(), delivery(body, 3)).await);
        assert!(transport.get_acknowledged().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_body_is_dead_lettered_and_acked() {
        let transport = Arc::new(MockTransport::new());
        let worker = sentiment_worker(transport.clone());

        assert!(handle_delivery(worker.as_ref(), transport.as_ref(), delivery(b"nope".to_vec(), 1)).await);
        assert_eq!(transport.get_dead_letters().await.len(), 1);
        assert_eq!(transport.get_acknowledged().await, vec![AckToken(1)]);
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_subject() {
        let transport = Arc::new(MockTransport::new());
        let mut dispatcher = Dispatcher::new(transport.clone());
        let queue = dispatcher.register(subject_for(Stage::Sentiment));

        let (tx, rx) = mpsc::channel(8);
        transport.set_inbound_sender(tx);
        let handle = tokio::spawn(dispatcher.run(rx));

        let routed = transport
            .inject(subject_for(Stage::Sentiment), b"{}".to_vec())
            .await
            .unwrap();
        let stray = transport
            .inject("domain.support.unknown", b"{}".to_vec())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), async {
            queue.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(received.ack, routed);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !transport.get_acknowledged().await.contains(&stray) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        handle.abort();
    }

    #[tokio::test]
    async fn test_workers_share_a_queue() {
        let transport = Arc::new(MockTransport::new());
        let (tx, queue) = work_queue();

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(tokio::spawn(run_worker(
                sentiment_worker(transport.clone()),
                transport.clone(),
                queue.clone(),
            )));
        }

        for ack in 0..6 {
            let body = serde_json::to_vec(&Message::new(format!("s-{ack}"), "hi")).unwrap();
            tx.send(delivery(body, ack)).unwrap();
        }
        drop(tx);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(transport.get_acknowledged().await.len(), 6);
        assert_eq!(transport.get_messages_on(subject_for(Stage::Intent)).await.len(), 6);
    }
}
