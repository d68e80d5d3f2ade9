//! Agent state and queue statistics

use std::time::Duration;

use tracing::{debug, info, warn};

use super::core::CallEngine;
use crate::entities::{AgentState, AgentStatus, QueueDefinition};
use crate::error::{CallEngineError, Result};
use crate::events::{AgentStatePayload, EventKind, Topic};
use crate::integration::bounded;
use crate::queue::{AgentCandidate, QueueStats, ServiceLevel};

impl CallEngine {
    /// Mark an agent available in the given queues, or in every queue it is a
    /// member of when `queue_ids` is empty.
    pub async fn agent_login(&self, extension_id: &str, queue_ids: &[String]) -> Result<Vec<AgentState>> {
        let member_of = self.member_queues(extension_id).await?;
        let queues = if queue_ids.is_empty() {
            member_of
        } else {
            if let Some(unknown) = queue_ids.iter().find(|q| !member_of.contains(q)) {
                return Err(CallEngineError::invalid_input(format!(
                    "extension {} is not a member of queue {}",
                    extension_id, unknown
                )));
            }
            queue_ids.to_vec()
        };

        info!("👤 Agent {} logging in to {:?}", extension_id, queues);
        self.record_agent_states(extension_id, &queues, AgentStatus::Available, None)
            .await
    }

    /// Take an agent offline in every queue it belongs to
    pub async fn agent_logout(&self, extension_id: &str) -> Result<Vec<AgentState>> {
        let queues = self.member_queues(extension_id).await?;
        info!("👤 Agent {} logging out", extension_id);
        self.record_agent_states(extension_id, &queues, AgentStatus::Offline, Some("logout".to_string()))
            .await
    }

    /// Set an agent's status in one queue, or in all of its queues
    pub async fn set_agent_state(
        &self,
        extension_id: &str,
        queue_id: Option<&str>,
        status: AgentStatus,
        reason_code: Option<String>,
    ) -> Result<Vec<AgentState>> {
        let member_of = self.member_queues(extension_id).await?;
        let queues = match queue_id {
            Some(queue_id) if member_of.iter().any(|q| q == queue_id) => vec![queue_id.to_string()],
            Some(queue_id) => {
                return Err(CallEngineError::invalid_input(format!(
                    "extension {} is not a member of queue {}",
                    extension_id, queue_id
                )));
            }
            None => member_of,
        };
        self.record_agent_states(extension_id, &queues, status, reason_code)
            .await
    }

    /// Live counters for a queue
    pub async fn queue_stats(&self, queue_id: &str) -> Result<QueueStats> {
        let queue = self.load_queue(queue_id).await?;
        let members = bounded(
            "list_active_members",
            queue_id,
            self.store_timeout(),
            self.entities.list_active_members(queue_id),
        )
        .await?;

        let mut stats = QueueStats {
            queue_id: queue.id.clone(),
            queue_name: queue.name.clone(),
            waiting_calls: self.distributor.waiting_count(&queue.id),
            active_calls: self.queue_active.get(&queue.id).map(|n| *n).unwrap_or(0),
            ..Default::default()
        };
        for member in &members {
            let status = self
                .latest_agent_state(&member.extension_id, &queue.id)
                .await?
                .map(|s| s.status)
                .unwrap_or(AgentStatus::Offline);
            match status {
                AgentStatus::Available => stats.available_agents += 1,
                AgentStatus::Busy => stats.busy_agents += 1,
                AgentStatus::WrapUp => stats.wrap_up_agents += 1,
                AgentStatus::Break | AgentStatus::Offline => {}
            }
        }
        Ok(stats)
    }

    /// Service level over the queue's completed calls
    pub async fn service_level(&self, queue_id: &str) -> Result<ServiceLevel> {
        let queue = self.load_queue(queue_id).await?;
        let completed = bounded(
            "completed_for_queue",
            queue_id,
            self.store_timeout(),
            self.records.completed_for_queue(queue_id),
        )
        .await?;
        let level = ServiceLevel::compute(&queue, &completed);
        if !level.meets_goal() {
            debug!(
                "📊 Queue {} below service level goal: {:?} < {}%",
                queue_id, level.ratio, level.goal_percent
            );
        }
        Ok(level)
    }

    /// Members of the queue with the inputs the distributor needs. Only
    /// registered agents are candidates.
    pub(super) async fn agent_candidates(&self, queue: &QueueDefinition) -> Result<Vec<AgentCandidate>> {
        let members = bounded(
            "list_active_members",
            &queue.id,
            self.store_timeout(),
            self.entities.list_active_members(&queue.id),
        )
        .await?;

        let now = self.clock.now();
        let mut candidates = Vec::with_capacity(members.len());
        for member in &members {
            if !self.directory.is_registered(&member.extension_id) {
                debug!("Agent {} in queue {} is not registered", member.extension_id, queue.id);
                continue;
            }
            let (status, changed_at) = self
                .latest_agent_state(&member.extension_id, &queue.id)
                .await?
                .map(|s| (s.status, s.changed_at))
                .unwrap_or((AgentStatus::Offline, now));
            let talk_time = self.talk_time.talk_time_secs(&member.extension_id).await;
            candidates.push(AgentCandidate::from_member(member, status, changed_at, talk_time));
        }
        Ok(candidates)
    }

    /// Set a status in every queue the agent belongs to. Failures are logged;
    /// call handling carries on regardless.
    pub(super) async fn update_agent_everywhere(
        &self,
        extension_id: &str,
        status: AgentStatus,
        reason_code: Option<String>,
    ) -> Vec<AgentState> {
        let queues = match self.member_queues(extension_id).await {
            Ok(queues) => queues,
            Err(e) => {
                warn!("Queues of agent {} unavailable: {}", extension_id, e);
                return Vec::new();
            }
        };
        match self
            .record_agent_states(extension_id, &queues, status, reason_code)
            .await
        {
            Ok(states) => states,
            Err(e) => {
                warn!("Setting agent {} to {} failed: {}", extension_id, status.as_str(), e);
                Vec::new()
            }
        }
    }

    /// Put an agent into wrap-up after a queue call and schedule the return
    /// to available per queue
    pub(super) async fn begin_wrap_up(&self, extension_id: &str) {
        let states = self
            .update_agent_everywhere(extension_id, AgentStatus::WrapUp, None)
            .await;
        for state in states {
            match self.load_queue(&state.queue_id).await {
                Ok(queue) => self.spawn_wrap_up_timer(state, Duration::from_secs(queue.wrap_up_time_secs)),
                Err(e) => warn!("Wrap-up for agent {} in {}: {}", extension_id, state.queue_id, e),
            }
        }
    }

    fn spawn_wrap_up_timer(&self, state: AgentState, wrap_up: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wrap_up).await;
            engine.end_wrap_up(state).await;
        });
    }

    /// Return to available unless the agent changed status meanwhile
    async fn end_wrap_up(&self, wrap_up: AgentState) {
        let latest = match self
            .latest_agent_state(&wrap_up.extension_id, &wrap_up.queue_id)
            .await
        {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Wrap-up end for agent {}: {}", wrap_up.extension_id, e);
                return;
            }
        };
        if latest.as_ref() != Some(&wrap_up) {
            debug!(
                "Agent {} left wrap-up in {} on its own",
                wrap_up.extension_id, wrap_up.queue_id
            );
            return;
        }
        let queues = [wrap_up.queue_id.clone()];
        if let Err(e) = self
            .record_agent_states(&wrap_up.extension_id, &queues, AgentStatus::Available, None)
            .await
        {
            warn!("Ending wrap-up for agent {} failed: {}", wrap_up.extension_id, e);
        }
    }

    pub(super) async fn publish_queue_stats(&self, queue_id: &str) {
        match self.queue_stats(queue_id).await {
            Ok(stats) => {
                self.events
                    .publish(Topic::queue(queue_id), EventKind::QueueStatsUpdated, &stats);
            }
            Err(e) => warn!("📊 Stats for queue {} unavailable: {}", queue_id, e),
        }
    }

    async fn record_agent_states(
        &self,
        extension_id: &str,
        queues: &[String],
        status: AgentStatus,
        reason_code: Option<String>,
    ) -> Result<Vec<AgentState>> {
        let now = self.clock.now();
        let mut recorded = Vec::with_capacity(queues.len());
        for queue_id in queues {
            let mut state = AgentState::new(extension_id, queue_id, status, now);
            state.reason_code = reason_code.clone();
            bounded(
                "record_agent_state",
                extension_id,
                self.store_timeout(),
                self.entities.record_agent_state(state.clone()),
            )
            .await?;

            debug!("Agent {} is {} in queue {}", extension_id, status.as_str(), queue_id);
            let payload = AgentStatePayload {
                extension_id: state.extension_id.clone(),
                queue_id: state.queue_id.clone(),
                status,
                reason_code: state.reason_code.clone(),
                timestamp: now,
            };
            self.events
                .publish(Topic::agents(), EventKind::AgentStateChanged, &payload);
            recorded.push(state);
        }

        for queue_id in queues {
            self.publish_queue_stats(queue_id).await;
        }
        Ok(recorded)
    }

    async fn member_queues(&self, extension_id: &str) -> Result<Vec<String>> {
        bounded(
            "find_extension_by_id",
            extension_id,
            self.store_timeout(),
            self.entities.find_extension_by_id(extension_id),
        )
        .await?;
        bounded(
            "queues_for_extension",
            extension_id,
            self.store_timeout(),
            self.entities.queues_for_extension(extension_id),
        )
        .await
    }

    async fn latest_agent_state(&self, extension_id: &str, queue_id: &str) -> Result<Option<AgentState>> {
        bounded(
            "most_recent_agent_state",
            extension_id,
            self.store_timeout(),
            self.entities.most_recent_agent_state(extension_id, queue_id),
        )
        .await
    }

    async fn load_queue(&self, queue_id: &str) -> Result<QueueDefinition> {
        bounded(
            "find_queue",
            queue_id,
            self.store_timeout(),
            self.entities.find_queue(queue_id),
        )
        .await
    }
}
