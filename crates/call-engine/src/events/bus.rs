//! Observer fan-out
//!
//! Each connected observer owns one bounded channel. Publishing never waits:
//! an observer whose buffer is full misses the event, and an observer whose
//! receiver was dropped is removed on the next publish. Events published from
//! the same task reach a given observer in publish order.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use pbx_registrar_core::{Clock, SystemClock};

use super::types::{EventEnvelope, EventKind, Topic, validate_channel};
use crate::config::{EventsConfig, ObserverToken};
use crate::error::{CallEngineError, Result};

/// Verifies the credential an observer presents once at connect time
#[async_trait]
pub trait ObserverAuthenticator: Send + Sync {
    /// Principal name for a valid token
    async fn authenticate(&self, token: &str) -> Result<String>;
}

/// Fixed set of bearer tokens from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: Vec<ObserverToken>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: Vec<ObserverToken>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(config.observer_tokens.clone())
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: impl Into<String>) -> Self {
        self.tokens.push(ObserverToken {
            token: token.into(),
            principal: principal.into(),
        });
        self
    }
}

#[async_trait]
impl ObserverAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<String> {
        self.tokens
            .iter()
            .find(|t| !t.token.is_empty() && t.token == token)
            .map(|t| t.principal.clone())
            .ok_or_else(|| CallEngineError::Authentication("invalid observer token".to_string()))
    }
}

/// Receiving side handed to a connected observer
#[derive(Debug)]
pub struct ObserverConnection {
    pub id: u64,
    pub principal: String,
    pub receiver: mpsc::Receiver<EventEnvelope>,
}

struct Observer {
    principal: String,
    channels: HashSet<String>,
    sender: mpsc::Sender<EventEnvelope>,
}

/// Real-time event fan-out to operator consoles
pub struct EventBus {
    observers: DashMap<u64, Observer>,
    next_id: AtomicU64,
    capacity: usize,
    authenticator: Arc<dyn ObserverAuthenticator>,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(capacity: usize, authenticator: Arc<dyn ObserverAuthenticator>) -> Self {
        Self::with_clock(capacity, authenticator, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, authenticator: Arc<dyn ObserverAuthenticator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            observers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            authenticator,
            clock,
        }
    }

    /// Authenticate and attach a new observer. The first envelope it receives
    /// is `CONNECTED`.
    pub async fn connect(&self, token: &str) -> Result<ObserverConnection> {
        let principal = self.authenticator.authenticate(token).await.map_err(|e| {
            warn!("🔒 Observer connection rejected: {}", e);
            e
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);

        let hello = EventEnvelope {
            event_type: EventKind::Connected,
            channel: None,
            timestamp: self.clock.now(),
            data: serde_json::json!({ "observer_id": id, "principal": principal }),
        };
        // fresh channel with capacity >= 1
        let _ = sender.try_send(hello);

        self.observers.insert(
            id,
            Observer {
                principal: principal.clone(),
                channels: HashSet::new(),
                sender,
            },
        );
        info!("🔌 Observer {} connected as {}", id, principal);

        Ok(ObserverConnection { id, principal, receiver })
    }

    /// Add channels to an observer's subscriptions; all names are checked
    /// before any is added. Returns the observer's full subscription list.
    pub fn subscribe(&self, observer_id: u64, channels: &[String]) -> Result<Vec<String>> {
        for channel in channels {
            validate_channel(channel)?;
        }
        let mut observer = self
            .observers
            .get_mut(&observer_id)
            .ok_or_else(|| CallEngineError::not_found(format!("observer {}", observer_id)))?;
        observer.channels.extend(channels.iter().cloned());
        debug!("Observer {} subscribed to {:?}", observer_id, channels);

        let mut current: Vec<String> = observer.channels.iter().cloned().collect();
        current.sort();
        Ok(current)
    }

    pub fn unsubscribe(&self, observer_id: u64, channels: &[String]) -> Result<Vec<String>> {
        let mut observer = self
            .observers
            .get_mut(&observer_id)
            .ok_or_else(|| CallEngineError::not_found(format!("observer {}", observer_id)))?;
        for channel in channels {
            observer.channels.remove(channel);
        }
        debug!("Observer {} unsubscribed from {:?}", observer_id, channels);

        let mut current: Vec<String> = observer.channels.iter().cloned().collect();
        current.sort();
        Ok(current)
    }

    pub fn disconnect(&self, observer_id: u64) {
        if let Some((_, observer)) = self.observers.remove(&observer_id) {
            info!("🔌 Observer {} ({}) disconnected", observer_id, observer.principal);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver an event to every observer the topic reaches. Returns how many
    /// observers accepted it.
    pub fn publish<T: Serialize>(&self, topic: Topic, kind: EventKind, payload: &T) -> usize {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize {} payload: {}", kind, e);
                return 0;
            }
        };
        let envelope = EventEnvelope {
            event_type: kind,
            channel: topic.channel_name().map(str::to_string),
            timestamp: self.clock.now(),
            data,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for observer in self.observers.iter() {
            let wants = match &topic {
                Topic::Broadcast => true,
                Topic::Channel(name) => observer.channels.contains(name),
            };
            if !wants {
                continue;
            }
            match observer.sender.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!("Observer {} lagging, dropped {}", observer.key(), kind);
                }
                Err(TrySendError::Closed(_)) => closed.push(*observer.key()),
            }
        }

        for id in closed {
            self.observers.remove(&id);
            debug!("Observer {} went away, removed", id);
        }

        delivered
    }
}
