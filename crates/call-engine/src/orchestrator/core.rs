//! Core call engine implementation
//!
//! [`CallEngine`] is a cheap, cloneable handle: every field is shared, so
//! timer tasks carry their own clone. The remaining orchestration logic lives
//! in sibling modules as further `impl CallEngine` blocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pbx_registrar_core::{Clock, DigestAuthenticator, ExtensionCatalog, RegistrationDirectory, SystemClock};

use super::uri_builder::SipUriBuilder;
use crate::config::EngineConfig;
use crate::database::{CallRecordStore, InMemoryCallRecordStore, SqliteCallRecordStore};
use crate::entities::{EntityStore, InMemoryTalkTimeLedger, TalkTimeLedger};
use crate::error::{CallEngineError, Result};
use crate::events::{CallEventPayload, EventBus, EventKind, ObserverAuthenticator, StaticTokenAuthenticator, Topic};
use crate::integration::{MediaProxy, SignalingEngine, bounded};
use crate::queue::QueueDistributor;
use crate::routing::RoutingEngine;
use crate::session::{CallSession, SessionRegistry, Transition};

/// PBX call control orchestrator
///
/// Ties the registration directory, routing engine, queue distributor and
/// session registry together and drives the external signaling and media
/// engines.
#[derive(Clone)]
pub struct CallEngine {
    pub(super) config: Arc<EngineConfig>,
    pub(super) clock: Arc<dyn Clock>,

    /// Persisted PBX configuration
    pub(super) entities: Arc<dyn EntityStore>,
    pub(super) signaling: Arc<dyn SignalingEngine>,
    pub(super) media: Arc<dyn MediaProxy>,
    pub(super) records: Arc<dyn CallRecordStore>,
    pub(super) talk_time: Arc<dyn TalkTimeLedger>,

    pub(super) directory: Arc<RegistrationDirectory>,
    pub(super) digest: Arc<DigestAuthenticator>,
    pub(super) routing: Arc<RoutingEngine>,
    pub(super) distributor: Arc<QueueDistributor>,
    pub(super) sessions: Arc<SessionRegistry>,
    pub(super) events: Arc<EventBus>,

    /// Answered, not yet ended queue calls per queue
    pub(super) queue_active: Arc<DashMap<String, usize>>,

    pub(super) housekeeping: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CallEngine {
    pub fn builder(config: EngineConfig) -> CallEngineBuilder {
        CallEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn directory(&self) -> &Arc<RegistrationDirectory> {
        &self.directory
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    pub fn distributor(&self) -> &Arc<QueueDistributor> {
        &self.distributor
    }

    pub fn call_records(&self) -> &Arc<dyn CallRecordStore> {
        &self.records
    }

    pub(super) fn uris(&self) -> SipUriBuilder<'_> {
        SipUriBuilder::new(&self.config.general)
    }

    pub(super) fn signaling_timeout(&self) -> Duration {
        self.config.timeouts.signaling_timeout()
    }

    pub(super) fn media_timeout(&self) -> Duration {
        self.config.timeouts.media_timeout()
    }

    pub(super) fn store_timeout(&self) -> Duration {
        self.config.timeouts.store_timeout()
    }

    /// Upsert the call record. A store failure is logged, never fatal to the call.
    pub(super) async fn persist(&self, session: &CallSession) {
        let saved = bounded(
            "save call record",
            &session.call_id,
            self.store_timeout(),
            self.records.save(session),
        )
        .await;
        if let Err(e) = saved {
            error!("Failed to persist call {} ({}): {}", session.call_id, session.kind(), e);
        }
    }

    /// Persist and broadcast a transition
    pub(super) async fn record_transition(&self, session: &CallSession, transition: Transition) {
        if let Transition::Changed { from, to } = transition {
            self.persist(session).await;
            let kind = EventKind::for_transition(from, to);
            self.events
                .publish(Topic::Broadcast, kind, &CallEventPayload::from(session));
        }
    }
}

/// Adapts the entity store to the registrar's extension catalog
struct StoreCatalog {
    entities: Arc<dyn EntityStore>,
    timeout: Duration,
}

#[async_trait]
impl ExtensionCatalog for StoreCatalog {
    async fn is_known(&self, extension_id: &str) -> bool {
        let found = bounded(
            "find_extension_by_id",
            extension_id,
            self.timeout,
            self.entities.find_extension_by_id(extension_id),
        )
        .await;
        match found {
            Ok(extension) => extension.is_active(),
            Err(CallEngineError::NotFound(_)) => false,
            Err(e) => {
                warn!("Extension lookup for {} failed: {}", extension_id, e);
                false
            }
        }
    }
}

/// Assembles a [`CallEngine`] from its collaborators
pub struct CallEngineBuilder {
    config: EngineConfig,
    entities: Option<Arc<dyn EntityStore>>,
    signaling: Option<Arc<dyn SignalingEngine>>,
    media: Option<Arc<dyn MediaProxy>>,
    records: Option<Arc<dyn CallRecordStore>>,
    talk_time: Option<Arc<dyn TalkTimeLedger>>,
    clock: Option<Arc<dyn Clock>>,
    observer_auth: Option<Arc<dyn ObserverAuthenticator>>,
    random_seed: Option<u64>,
}

impl CallEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            entities: None,
            signaling: None,
            media: None,
            records: None,
            talk_time: None,
            clock: None,
            observer_auth: None,
            random_seed: None,
        }
    }

    pub fn with_entity_store(mut self, entities: Arc<dyn EntityStore>) -> Self {
        self.entities = Some(entities);
        self
    }

    pub fn with_signaling(mut self, signaling: Arc<dyn SignalingEngine>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaProxy>) -> Self {
        self.media = Some(media);
        self
    }

    /// Defaults to SQLite when `database.url` is set, in-memory otherwise
    pub fn with_call_records(mut self, records: Arc<dyn CallRecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_talk_time(mut self, talk_time: Arc<dyn TalkTimeLedger>) -> Self {
        self.talk_time = Some(talk_time);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to the tokens in `events.observer_tokens`
    pub fn with_observer_authenticator(mut self, auth: Arc<dyn ObserverAuthenticator>) -> Self {
        self.observer_auth = Some(auth);
        self
    }

    /// Make the `random` queue strategy reproducible
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub async fn build(self) -> Result<CallEngine> {
        self.config.validate()?;

        let entities = self
            .entities
            .ok_or_else(|| CallEngineError::config("an entity store is required"))?;
        let signaling = self
            .signaling
            .ok_or_else(|| CallEngineError::config("a signaling engine is required"))?;
        let media = self
            .media
            .ok_or_else(|| CallEngineError::config("a media proxy is required"))?;

        let records: Arc<dyn CallRecordStore> = match (self.records, &self.config.database.url) {
            (Some(records), _) => records,
            (None, Some(_)) => Arc::new(SqliteCallRecordStore::from_config(&self.config.database).await?),
            (None, None) => Arc::new(InMemoryCallRecordStore::new()),
        };
        let talk_time = self
            .talk_time
            .unwrap_or_else(|| Arc::new(InMemoryTalkTimeLedger::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let observer_auth = self
            .observer_auth
            .unwrap_or_else(|| Arc::new(StaticTokenAuthenticator::from_config(&self.config.events)));

        let catalog = Arc::new(StoreCatalog {
            entities: entities.clone(),
            timeout: self.config.timeouts.store_timeout(),
        });
        let directory = Arc::new(RegistrationDirectory::with_clock(
            self.config.registrar.clone(),
            catalog,
            clock.clone(),
        ));
        let digest = Arc::new(DigestAuthenticator::with_clock(
            self.config.registrar.realm.clone(),
            self.config.registrar.nonce_ttl_secs,
            clock.clone(),
        ));
        let distributor = match self.random_seed {
            Some(seed) => QueueDistributor::with_seed(seed),
            None => QueueDistributor::new(),
        };
        let events = EventBus::with_clock(
            self.config.events.observer_channel_capacity,
            observer_auth,
            clock.clone(),
        );

        info!(
            "🚀 Call engine ready (domain {}, realm {})",
            self.config.general.domain, self.config.registrar.realm
        );

        Ok(CallEngine {
            routing: Arc::new(RoutingEngine::new(entities.clone())),
            config: Arc::new(self.config),
            clock,
            entities,
            signaling,
            media,
            records,
            talk_time,
            directory,
            digest,
            distributor: Arc::new(distributor),
            sessions: Arc::new(SessionRegistry::new()),
            events: Arc::new(events),
            queue_active: Arc::new(DashMap::new()),
            housekeeping: Arc::new(Mutex::new(None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        AgentState, Extension, InMemoryEntityStore, InboundRule, OutboundRule, QueueDefinition, QueueMember, Trunk,
    };
    use crate::testing::{RecordingMediaProxy, RecordingSignaling};

    /// Answers nothing about extensions ids, ever
    struct StalledStore;

    #[async_trait]
    impl EntityStore for StalledStore {
        async fn find_extension_by_number(&self, number: &str) -> Result<Extension> {
            Err(CallEngineError::not_found(number))
        }
        async fn find_extension_by_id(&self, _id: &str) -> Result<Extension> {
            futures::future::pending().await
        }
        async fn find_trunk(&self, id: &str) -> Result<Trunk> {
            Err(CallEngineError::not_found(id))
        }
        async fn find_queue(&self, id: &str) -> Result<QueueDefinition> {
            Err(CallEngineError::not_found(id))
        }
        async fn list_active_members(&self, _queue_id: &str) -> Result<Vec<QueueMember>> {
            Ok(Vec::new())
        }
        async fn queues_for_extension(&self, _extension_id: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn most_recent_agent_state(&self, _extension_id: &str, _queue_id: &str) -> Result<Option<AgentState>> {
            Ok(None)
        }
        async fn record_agent_state(&self, _state: AgentState) -> Result<()> {
            Ok(())
        }
        async fn inbound_rules(&self) -> Result<Vec<InboundRule>> {
            Ok(Vec::new())
        }
        async fn outbound_rules(&self) -> Result<Vec<OutboundRule>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_lookup_is_bounded() {
        let catalog = StoreCatalog {
            entities: Arc::new(StalledStore),
            timeout: Duration::from_millis(500),
        };
        let started = tokio::time::Instant::now();
        assert!(!catalog.is_known("e100").await);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let missing = CallEngine::builder(EngineConfig::default())
            .with_entity_store(InMemoryEntityStore::shared())
            .build()
            .await;
        assert!(matches!(missing.err(), Some(CallEngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let engine = CallEngine::builder(EngineConfig::default())
            .with_entity_store(InMemoryEntityStore::shared())
            .with_signaling(Arc::new(RecordingSignaling::new()))
            .with_media(Arc::new(RecordingMediaProxy::new()))
            .build()
            .await
            .unwrap();
        assert_eq!(engine.config().general.domain, "pbx.local");
        assert!(engine.active_calls().await.is_empty());
    }
}
