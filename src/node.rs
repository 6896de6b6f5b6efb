//! Mesh node lifecycle
//!
//! A node hosts any subset of the stages. Starting it connects the bus, joins
//! the work queue of every hosted stage, then spawns the dispatcher and
//! `concurrency` workers per stage. Collaborators are injected so the same
//! node runs against the broker in production and the in-memory bus in tests.

use crate::actor::stages::{
    ContextActor, DecisionActor, ExecutionActor, GuardrailsActor, HandoffActor, IntentActor,
    ResponseActor, SentimentActor,
};
use crate::actor::worker::{run_delivery_forwarder, run_worker, Dispatcher, StageWorker};
use crate::actor::{Actor, ActorRuntime, ResponseAggregator, RuntimeSettings};
use crate::config::{ConfigError, MeshConfig};
use crate::gateway::{BusSessionDelivery, Gateway, SessionRegistry};
use crate::health::{
    AuditStoreHealthCheck, BusHealthCheck, ContextCacheHealthCheck, GeneratorHealthCheck,
    HealthCheckManager,
};
use crate::llm::provider::{LlmError, LlmProvider};
use crate::llm::providers::{OpenAiConfig, OpenAiProvider};
use crate::observability::health::HealthServer;
use crate::observability::metrics::metrics;
use crate::protocol::{subject_for, Stage, DELIVERIES_SUBJECT};
use crate::routing::{DecisionPolicy, DecisionRouter, EscalationPolicy, EscalationRouter};
use crate::services::audit::{AuditError, AuditStore, SqliteAuditStore};
use crate::services::context::{
    CachedContextStore, ContextStore, HttpProfileSource, MemoryContextCache, StaticProfileSource,
};
use crate::services::execution::{AcceptingActionExecutor, ActionExecutor, HttpActionExecutor};
use crate::services::generation::{
    LlmResponseGenerator, ResponseGenerator, TemplateResponseGenerator,
};
use crate::services::session::MemorySessionStore;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Inbound deliveries buffered between the transport and the dispatcher
const INBOUND_CAPACITY: usize = 256;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// External services the stages call out to
pub struct Collaborators<A: AuditStore> {
    pub context: Arc<dyn ContextStore>,
    pub audit: Arc<A>,
    pub executor: Arc<dyn ActionExecutor>,
    pub generator: Arc<dyn ResponseGenerator>,
}

impl<A: AuditStore> Clone for Collaborators<A> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            audit: self.audit.clone(),
            executor: self.executor.clone(),
            generator: self.generator.clone(),
        }
    }
}

impl Collaborators<SqliteAuditStore> {
    /// Production collaborators; local stand-ins where a service URL is absent
    pub async fn from_config(config: &MeshConfig) -> Result<Self, NodeError> {
        let cache = MemoryContextCache::new();
        let context: Arc<dyn ContextStore> = match &config.context.profile_service_url {
            Some(url) => Arc::new(CachedContextStore::from_config(
                cache,
                HttpProfileSource::new(url.clone()),
                &config.context,
            )),
            None => Arc::new(CachedContextStore::from_config(
                cache,
                StaticProfileSource::new(),
                &config.context,
            )),
        };

        let executor: Arc<dyn ActionExecutor> = match &config.execution.service_url {
            Some(url) => Arc::new(HttpActionExecutor::new(url.clone())),
            None => Arc::new(AcceptingActionExecutor),
        };

        let generator: Arc<dyn ResponseGenerator> = match &config.llm {
            Some(section) => {
                let api_key = config.get_llm_api_key()?.unwrap_or_default();
                let provider: Arc<dyn LlmProvider> =
                    Arc::new(OpenAiProvider::new(OpenAiConfig::from_section(section, api_key))?);
                Arc::new(LlmResponseGenerator::new(provider, section))
            }
            None => Arc::new(TemplateResponseGenerator),
        };

        let audit = Arc::new(SqliteAuditStore::connect(&config.audit.database_url).await?);
        info!(database_url = %config.audit.database_url, "Audit store ready");

        Ok(Self {
            context,
            audit,
            executor,
            generator,
        })
    }
}

/// Actor for a pipeline stage; `None` for the Aggregator, which is not an actor
pub fn build_actor<A: AuditStore>(
    stage: Stage,
    config: &MeshConfig,
    collaborators: &Collaborators<A>,
) -> Option<Arc<dyn Actor>> {
    let actor: Arc<dyn Actor> = match stage {
        Stage::Sentiment => Arc::new(SentimentActor::from_config(&config.routing)),
        Stage::Intent => Arc::new(IntentActor::from_config(&config.routing)),
        Stage::Context => Arc::new(ContextActor::new(collaborators.context.clone())),
        Stage::Decision => Arc::new(DecisionActor),
        Stage::Execution => Arc::new(
            ExecutionActor::new(collaborators.executor.clone())
                .with_context_store(collaborators.context.clone()),
        ),
        Stage::Response => Arc::new(ResponseActor::new(
            collaborators.generator.clone(),
            config.generation_timeout(),
        )),
        Stage::Guardrails => Arc::new(GuardrailsActor),
        Stage::HumanHandoff => Arc::new(HandoffActor),
        Stage::Aggregator => return None,
    };
    Some(actor)
}

/// Subjects this node consumes (pure function)
pub fn subjects_for(config: &MeshConfig, gateway: bool) -> Vec<&'static str> {
    let mut subjects: Vec<&'static str> = config
        .mesh
        .stages
        .iter()
        .map(|stage| subject_for(*stage))
        .collect();
    if gateway {
        subjects.push(DELIVERIES_SUBJECT);
    }
    subjects
}

pub struct MeshNode<T, A>
where
    T: Transport + 'static,
    A: AuditStore + 'static,
{
    config: MeshConfig,
    transport: Option<T>,
    running_transport: Option<Arc<T>>,
    collaborators: Collaborators<A>,
    gateway_mode: bool,
    sessions: Arc<SessionRegistry>,
    session_state: Arc<MemorySessionStore>,
    gateway: Option<Arc<Gateway<T>>>,
    handles: Vec<JoinHandle<()>>,
    health_server: Option<Arc<HealthServer>>,
    health_check_manager: Arc<HealthCheckManager>,
}

impl<T, A> MeshNode<T, A>
where
    T: Transport + 'static,
    A: AuditStore + 'static,
{
    pub fn new(config: MeshConfig, transport: T, collaborators: Collaborators<A>) -> Self {
        let session_state = Arc::new(MemorySessionStore::from_config(&config.sessions));
        Self {
            config,
            transport: Some(transport),
            running_transport: None,
            collaborators,
            gateway_mode: false,
            sessions: Arc::new(SessionRegistry::new()),
            session_state,
            gateway: None,
            handles: Vec::new(),
            health_server: None,
            health_check_manager: Arc::new(HealthCheckManager::new()),
        }
    }

    /// Also forward delivery records to sessions registered on this node
    pub fn with_gateway(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.gateway_mode = true;
        self.sessions = sessions;
        self
    }

    pub fn set_health_server(&mut self, health_server: Arc<HealthServer>) {
        self.health_server = Some(health_server);
    }

    pub fn mesh_id(&self) -> &str {
        &self.config.mesh.id
    }

    pub fn health_check_manager(&self) -> &Arc<HealthCheckManager> {
        &self.health_check_manager
    }

    /// Bus handle once started
    pub fn transport(&self) -> Option<&Arc<T>> {
        self.running_transport.as_ref()
    }

    /// Turn intake for a running gateway node
    pub fn gateway(&self) -> Option<&Arc<Gateway<T>>> {
        self.gateway.as_ref()
    }

    pub fn session_state(&self) -> &Arc<MemorySessionStore> {
        &self.session_state
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        match (&self.transport, &self.running_transport) {
            (Some(transport), _) => transport.is_permanently_disconnected(),
            (None, Some(transport)) => transport.is_permanently_disconnected(),
            (None, None) => false,
        }
    }

    fn setup_health_checks(
        transport: Arc<T>,
        collaborators: &Collaborators<A>,
    ) -> Arc<HealthCheckManager> {
        let mut manager = HealthCheckManager::new();
        manager.add_health_check(Box::new(BusHealthCheck::new(transport)));
        let audit: Arc<dyn AuditStore> = collaborators.audit.clone();
        manager.add_health_check(Box::new(AuditStoreHealthCheck::new(audit)));
        manager.add_health_check(Box::new(ContextCacheHealthCheck::new(
            collaborators.context.clone(),
        )));
        manager.add_health_check(Box::new(GeneratorHealthCheck::new(
            collaborators.generator.clone(),
        )));
        Arc::new(manager)
    }

    fn build_worker(&self, stage: Stage, transport: &Arc<T>) -> Arc<dyn StageWorker> {
        match build_actor(stage, &self.config, &self.collaborators) {
            Some(actor) => Arc::new(ActorRuntime::new(
                actor,
                transport.clone(),
                DecisionRouter::new(DecisionPolicy::from(&self.config.routing)),
                EscalationRouter::new(EscalationPolicy::from(&self.config.escalation)),
                RuntimeSettings::from(&self.config.mesh),
            )),
            None => Arc::new(ResponseAggregator::new(
                self.collaborators.audit.clone(),
                Arc::new(BusSessionDelivery::new(transport.clone())),
                transport.clone(),
            )),
        }
    }

    /// Connect, subscribe and spawn every worker
    pub async fn start(&mut self) -> Result<(), NodeError> {
        info!(mesh_id = %self.config.mesh.id, "Starting mesh node");
        metrics().set_node_state("starting");

        let mut transport = self.transport.take().ok_or_else(|| {
            NodeError::Initialization("Node already started".to_string())
        })?;

        metrics().bus_connection_attempt();
        transport
            .connect()
            .await
            .map_err(|e| NodeError::Transport(Box::new(e)))?;
        metrics().bus_connection_established();
        info!("Bus connected");

        // Installed before joining any queue; deliveries buffer until the dispatcher runs
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        transport.set_inbound_sender(inbound_tx);

        let subjects = subjects_for(&self.config, self.gateway_mode);
        for subject in &subjects {
            transport
                .subscribe(subject)
                .await
                .map_err(|e| NodeError::Transport(Box::new(e)))?;
        }
        info!(subjects = subjects.len(), group = %self.config.mesh.consumer_group, "Joined work queues");

        let transport = Arc::new(transport);

        self.health_check_manager = Self::setup_health_checks(transport.clone(), &self.collaborators);
        let results = self.health_check_manager.run_health_checks().await;
        for result in &results {
            if result.healthy {
                info!(component = %result.component, "Component healthy");
            } else {
                warn!(
                    component = %result.component,
                    message = result.message.as_deref().unwrap_or("unknown error"),
                    "Component unhealthy"
                );
            }
        }
        // Only the bus is fatal; other collaborators degrade to fallbacks
        if results
            .iter()
            .any(|result| result.component == "bus_transport" && !result.healthy)
        {
            return Err(NodeError::Initialization(
                "Bus failed its initial health check".to_string(),
            ));
        }
        if let Some(server) = &self.health_server {
            server.record_results(&results).await;
            server.set_bus_connected(true);
        }

        let mut dispatcher = Dispatcher::new(transport.clone());
        let concurrency = self.config.mesh.concurrency.max(1);

        for stage in self.config.mesh.stages.clone() {
            let queue = dispatcher.register(subject_for(stage));
            let worker = self.build_worker(stage, &transport);
            for _ in 0..concurrency {
                self.handles.push(tokio::spawn(run_worker(
                    worker.clone(),
                    transport.clone(),
                    queue.clone(),
                )));
            }
            info!(stage = stage.as_str(), workers = concurrency, "Stage workers started");
        }

        if self.gateway_mode {
            let queue = dispatcher.register(DELIVERIES_SUBJECT);
            let turn_log: Arc<dyn AuditStore> = self.collaborators.audit.clone();
            let gateway = Arc::new(
                Gateway::new(transport.clone(), self.sessions.clone())
                    .with_session_state(self.session_state.clone())
                    .with_turn_log(turn_log),
            );
            self.gateway = Some(gateway.clone());
            self.handles.push(tokio::spawn(run_delivery_forwarder(
                gateway,
                transport.clone(),
                queue,
            )));
            info!("Delivery forwarder started");
        }

        self.handles.push(tokio::spawn(dispatcher.run(inbound_rx)));
        self.handles.push(Self::spawn_health_monitor(
            self.health_check_manager.clone(),
            self.health_server.clone(),
        ));

        self.running_transport = Some(transport);
        metrics().set_node_state("running");
        info!("Mesh node started");
        Ok(())
    }

    /// Re-run health checks periodically and publish the results
    fn spawn_health_monitor(
        manager: Arc<HealthCheckManager>,
        server: Option<Arc<HealthServer>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            interval.tick().await;

            loop {
                interval.tick().await;
                let results = manager.run_health_checks().await;
                let healthy = results.iter().all(|result| result.healthy);
                metrics().update_health_status(healthy);
                if let Some(server) = &server {
                    let bus_healthy = results
                        .iter()
                        .any(|result| result.component == "bus_transport" && result.healthy);
                    server.set_bus_connected(bus_healthy);
                    server.record_results(&results).await;
                }
            }
        })
    }

    /// Stop every spawned task
    ///
    /// Deliveries in flight stay unacknowledged and are redelivered to
    /// another consumer in the group.
    pub async fn shutdown(&mut self) -> Result<(), NodeError> {
        info!(mesh_id = %self.config.mesh.id, "Shutting down mesh node");
        metrics().set_node_state("stopping");

        for handle in self.handles.drain(..) {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Task shutdown error");
                }
            }
        }
        if let Some(server) = &self.health_server {
            server.set_bus_connected(false);
        }

        metrics().set_node_state("stopped");
        info!("Mesh node shutdown complete");
        Ok(())
    }
}

/// Node lifecycle errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error")]
    Configuration(#[source] ConfigError),
    #[error("Transport error")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Audit store error")]
    Audit(#[source] AuditError),
    #[error("LLM provider error")]
    Llm(#[source] LlmError),
    #[error("Initialization error: {0}")]
    Initialization(String),
}

impl From<ConfigError> for NodeError {
    fn from(err: ConfigError) -> Self {
        NodeError::Configuration(err)
    }
}

impl From<AuditError> for NodeError {
    fn from(err: AuditError) -> Self {
        NodeError::Audit(err)
    }
}

impl From<LlmError> for NodeError {
    fn from(err: LlmError) -> Self {
        NodeError::Llm(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::aggregator::build_record;
    use crate::gateway::TurnRequest;
    use crate::protocol::{Message, Route, RoutedTo};
    use crate::services::audit::Direction;
    use crate::services::session::{SessionStatus, SessionStore};
    use crate::testing::mocks::{MemoryAuditStore, MockTransport, StaticContextStore};

    const CONFIG: &str = r#"
[mesh]
id = "node-test"
concurrency = 2

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;

    fn collaborators() -> Collaborators<MemoryAuditStore> {
        Collaborators {
            context: Arc::new(StaticContextStore::new()),
            audit: Arc::new(MemoryAuditStore::new()),
            executor: Arc::new(AcceptingActionExecutor),
            generator: Arc::new(TemplateResponseGenerator),
        }
    }

    fn config() -> MeshConfig {
        MeshConfig::from_toml_str(CONFIG).unwrap()
    }

    #[test]
    fn test_every_stage_but_aggregator_has_an_actor() {
        let config = config();
        let collaborators = collaborators();
        for stage in Stage::ALL {
            let actor = build_actor(stage, &config, &collaborators);
            match stage {
                Stage::Aggregator => assert!(actor.is_none()),
                _ => assert_eq!(actor.unwrap().stage(), stage),
            }
        }
    }

    #[test]
    fn test_gateway_adds_deliveries_subject() {
        let config = config();
        assert_eq!(subjects_for(&config, false).len(), Stage::ALL.len());
        assert!(subjects_for(&config, true).contains(&DELIVERIES_SUBJECT));
    }

    #[tokio::test]
    async fn test_start_subscribes_and_processes() {
        let mut node = MeshNode::new(config(), MockTransport::new(), collaborators());
        node.start().await.unwrap();
        assert!(node.is_running());

        let transport = node.transport().unwrap().clone();
        assert_eq!(transport.get_subscriptions().await.len(), Stage::ALL.len());

        let body = serde_json::to_vec(&Message::new("s-1", "Where is my order?")).unwrap();
        let ack = transport
            .inject(subject_for(Stage::Sentiment), body)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !transport.get_acknowledged().await.contains(&ack) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        node.shutdown().await.unwrap();
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_delivery_arriving_during_start_is_processed() {
        let transport = MockTransport::new();
        let body = serde_json::to_vec(&Message::new("s-early", "Where is my order?")).unwrap();
        let ack = transport
            .deliver_on_subscribe(subject_for(Stage::Sentiment), body)
            .await;

        let mut node = MeshNode::new(config(), transport, collaborators());
        node.start().await.unwrap();
        let transport = node.transport().unwrap().clone();
        assert!(transport.get_dropped().await.is_empty());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !transport.get_acknowledged().await.contains(&ack) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(transport.get_messages_on(subject_for(Stage::Intent)).await.len(), 1);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_node_tracks_sessions_and_transcript() {
        let audit = Arc::new(MemoryAuditStore::new());
        let collaborators = Collaborators {
            audit: audit.clone(),
            ..collaborators()
        };
        let sessions = Arc::new(SessionRegistry::new());
        let mut node = MeshNode::new(config(), MockTransport::new(), collaborators)
            .with_gateway(sessions.clone());
        assert!(node.gateway().is_none());
        node.start().await.unwrap();

        let mut live = sessions.connect("s-gw").await;
        let gateway = node.gateway().unwrap().clone();
        let message = gateway
            .submit_turn(TurnRequest::new("s-gw", "Where is my order?").with_customer("c-1"))
            .await
            .unwrap();
        let state = node.session_state().get("s-gw").await.unwrap().unwrap();
        assert_eq!(state.message_count, 1);
        assert_eq!(state.customer_id.as_deref(), Some("c-1"));
        assert_eq!(state.status, SessionStatus::Active);

        let transcript = audit.transcript("s-gw").await.unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].message_id, message.id);
        assert_eq!(transcript[0].direction, Direction::Inbound);

        // The aggregator's record comes back on the deliveries subject
        let mut record = build_record(&message.clone().with_route(
            Route::new(vec![Stage::Aggregator], 0).unwrap(),
        ));
        record.routed_to = RoutedTo::HumanHandoff;
        let transport = node.transport().unwrap().clone();
        transport
            .inject(DELIVERIES_SUBJECT, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();
        let forwarded = tokio::time::timeout(Duration::from_secs(2), live.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.message_id, message.id);

        let state = node.session_state().get("s-gw").await.unwrap().unwrap();
        assert_eq!(state.status, SessionStatus::HandedOff);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut node = MeshNode::new(config(), MockTransport::new(), collaborators());
        node.start().await.unwrap();
        assert!(matches!(
            node.start().await,
            Err(NodeError::Initialization(_))
        ));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_failure_is_reported() {
        let mut node = MeshNode::new(config(), MockTransport::with_failure(), collaborators());
        assert!(matches!(node.start().await, Err(NodeError::Transport(_))));
    }
}
