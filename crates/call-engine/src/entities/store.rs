//! Entity store collaborator

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::{AgentState, Extension, InboundRule, OutboundRule, QueueDefinition, QueueMember, Trunk};
use crate::error::{CallEngineError, Result};

/// Keyed lookups into the persisted PBX configuration.
///
/// Not-found is always reported as [`CallEngineError::NotFound`].
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_extension_by_number(&self, number: &str) -> Result<Extension>;

    async fn find_extension_by_id(&self, id: &str) -> Result<Extension>;

    async fn find_trunk(&self, id: &str) -> Result<Trunk>;

    async fn find_queue(&self, id: &str) -> Result<QueueDefinition>;

    /// Members of a queue; membership alone does not mean availability
    async fn list_active_members(&self, queue_id: &str) -> Result<Vec<QueueMember>>;

    /// Queues an extension is a member of
    async fn queues_for_extension(&self, extension_id: &str) -> Result<Vec<String>>;

    async fn most_recent_agent_state(
        &self,
        extension_id: &str,
        queue_id: &str,
    ) -> Result<Option<AgentState>>;

    async fn record_agent_state(&self, state: AgentState) -> Result<()>;

    /// Inbound rules in creation order
    async fn inbound_rules(&self) -> Result<Vec<InboundRule>>;

    /// Outbound rules in creation order
    async fn outbound_rules(&self) -> Result<Vec<OutboundRule>>;
}

/// In-memory entity store, keyed the way the persisted tables are
#[derive(Default)]
pub struct InMemoryEntityStore {
    extensions: DashMap<String, Extension>,
    /// number -> extension id
    numbers: DashMap<String, String>,
    trunks: DashMap<String, Trunk>,
    queues: DashMap<String, QueueDefinition>,
    members: DashMap<String, Vec<QueueMember>>,
    agent_states: DashMap<(String, String), AgentState>,
    inbound: RwLock<Vec<InboundRule>>,
    outbound: RwLock<Vec<OutboundRule>>,
    rule_sequence: AtomicU64,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_extension(&self, extension: Extension) -> Result<()> {
        if self.extensions.contains_key(&extension.id) {
            return Err(CallEngineError::conflict(format!("extension id {}", extension.id)));
        }
        if self.numbers.contains_key(&extension.number) {
            return Err(CallEngineError::conflict(format!("extension number {}", extension.number)));
        }
        self.numbers.insert(extension.number.clone(), extension.id.clone());
        self.extensions.insert(extension.id.clone(), extension);
        Ok(())
    }

    pub fn add_trunk(&self, trunk: Trunk) -> Result<()> {
        if self.trunks.contains_key(&trunk.id) {
            return Err(CallEngineError::conflict(format!("trunk {}", trunk.id)));
        }
        self.trunks.insert(trunk.id.clone(), trunk);
        Ok(())
    }

    /// Replace a trunk definition (status flips, limit changes)
    pub fn update_trunk(&self, trunk: Trunk) {
        self.trunks.insert(trunk.id.clone(), trunk);
    }

    pub fn add_queue(&self, queue: QueueDefinition) -> Result<()> {
        if self.queues.contains_key(&queue.id) {
            return Err(CallEngineError::conflict(format!("queue {}", queue.id)));
        }
        self.queues.insert(queue.id.clone(), queue);
        Ok(())
    }

    pub fn update_queue(&self, queue: QueueDefinition) {
        self.queues.insert(queue.id.clone(), queue);
    }

    pub fn add_member(&self, member: QueueMember) -> Result<()> {
        let mut members = self.members.entry(member.queue_id.clone()).or_default();
        if members.iter().any(|m| m.extension_id == member.extension_id) {
            return Err(CallEngineError::conflict(format!(
                "{} already in queue {}",
                member.extension_id, member.queue_id
            )));
        }
        members.push(member);
        Ok(())
    }

    pub fn add_inbound_rule(&self, mut rule: InboundRule) -> Result<()> {
        let mut rules = self.inbound.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CallEngineError::conflict(format!("inbound rule {}", rule.id)));
        }
        rule.sequence = self.rule_sequence.fetch_add(1, Ordering::SeqCst);
        rules.push(rule);
        Ok(())
    }

    pub fn add_outbound_rule(&self, mut rule: OutboundRule) -> Result<()> {
        let mut rules = self.outbound.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CallEngineError::conflict(format!("outbound rule {}", rule.id)));
        }
        rule.sequence = self.rule_sequence.fetch_add(1, Ordering::SeqCst);
        rules.push(rule);
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn find_extension_by_number(&self, number: &str) -> Result<Extension> {
        let id = self
            .numbers
            .get(number)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallEngineError::not_found(format!("extension number {}", number)))?;
        self.find_extension_by_id(&id).await
    }

    async fn find_extension_by_id(&self, id: &str) -> Result<Extension> {
        self.extensions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallEngineError::not_found(format!("extension {}", id)))
    }

    async fn find_trunk(&self, id: &str) -> Result<Trunk> {
        self.trunks
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallEngineError::not_found(format!("trunk {}", id)))
    }

    async fn find_queue(&self, id: &str) -> Result<QueueDefinition> {
        self.queues
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallEngineError::not_found(format!("queue {}", id)))
    }

    async fn list_active_members(&self, queue_id: &str) -> Result<Vec<QueueMember>> {
        if !self.queues.contains_key(queue_id) {
            return Err(CallEngineError::not_found(format!("queue {}", queue_id)));
        }
        let members = self
            .members
            .get(queue_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        // only active extensions take calls
        Ok(members
            .into_iter()
            .filter(|m| {
                self.extensions
                    .get(&m.extension_id)
                    .map(|ext| ext.is_active())
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn queues_for_extension(&self, extension_id: &str) -> Result<Vec<String>> {
        let mut queues: Vec<String> = self
            .members
            .iter()
            .filter(|entry| entry.value().iter().any(|m| m.extension_id == extension_id))
            .map(|entry| entry.key().clone())
            .collect();
        queues.sort();
        Ok(queues)
    }

    async fn most_recent_agent_state(
        &self,
        extension_id: &str,
        queue_id: &str,
    ) -> Result<Option<AgentState>> {
        Ok(self
            .agent_states
            .get(&(extension_id.to_string(), queue_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn record_agent_state(&self, state: AgentState) -> Result<()> {
        debug!(
            "Agent {} in queue {} -> {}",
            state.extension_id,
            state.queue_id,
            state.status.as_str()
        );
        self.agent_states
            .insert((state.extension_id.clone(), state.queue_id.clone()), state);
        Ok(())
    }

    async fn inbound_rules(&self) -> Result<Vec<InboundRule>> {
        Ok(self.inbound.read().clone())
    }

    async fn outbound_rules(&self) -> Result<Vec<OutboundRule>> {
        Ok(self.outbound.read().clone())
    }
}
