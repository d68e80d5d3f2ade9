use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::strategy::{self, AgentCandidate};
use crate::entities::{OverflowAction, QueueDefinition, QueueStatus, QueueStrategy};
use crate::session::HangupCause;

/// A call waiting in a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingCall {
    pub call_id: String,
    pub caller_number: String,
    pub entered_at: DateTime<Utc>,
    pub required_skill: Option<String>,
}

/// Why a call left the queue without reaching an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowReason {
    QueueFull,
    NoEligibleAgents,
    WaitTimeExceeded,
    QueueUnavailable,
}

impl OverflowReason {
    /// Cause recorded when the overflow action is `hangup`
    pub fn hangup_cause(&self) -> HangupCause {
        match self {
            OverflowReason::WaitTimeExceeded => HangupCause::Timeout,
            _ => HangupCause::Busy,
        }
    }
}

/// Overflow signal carrying the queue's configured action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overflow {
    pub queue_id: String,
    pub reason: OverflowReason,
    pub action: OverflowAction,
    pub destination: Option<String>,
}

impl Overflow {
    pub fn new(queue: &QueueDefinition, reason: OverflowReason) -> Self {
        Self {
            queue_id: queue.id.clone(),
            reason,
            action: queue.overflow_action,
            destination: queue.overflow_destination.clone(),
        }
    }
}

/// Outcome of distributing one waiting call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Distribution {
    /// Offer the call to these extensions (several only for `ring_all`)
    Offer(Vec<String>),
    Overflow(Overflow),
}

/// Queue distribution engine
///
/// Tracks waiting calls per queue and selects agents. The round-robin cursor
/// of each queue lives behind its own mutex and is read, used and advanced in
/// one critical section.
pub struct QueueDistributor {
    /// Calls currently waiting, per queue, in arrival order
    waiting: DashMap<String, VecDeque<WaitingCall>>,
    /// Key of the member chosen last, per queue
    cursors: DashMap<String, Arc<Mutex<Option<(i32, String)>>>>,
    rng: Mutex<StdRng>,
}

impl QueueDistributor {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic `random` strategy
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            waiting: DashMap::new(),
            cursors: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Admit a call into the queue's waiting set
    pub fn enqueue(&self, queue: &QueueDefinition, call: WaitingCall) -> Result<usize, Overflow> {
        if queue.status != QueueStatus::Active {
            warn!("📞 Queue {} is {:?}, overflowing call {}", queue.id, queue.status, call.call_id);
            return Err(Overflow::new(queue, OverflowReason::QueueUnavailable));
        }

        let mut waiting = self.waiting.entry(queue.id.clone()).or_default();
        if waiting.iter().any(|c| c.call_id == call.call_id) {
            warn!("📞 Call {} already in queue {}, not re-queuing", call.call_id, queue.id);
            return Ok(waiting.len());
        }
        if waiting.len() >= queue.max_queue_size {
            warn!(
                "📞 Queue {} full ({} waiting), overflowing call {}",
                queue.id,
                waiting.len(),
                call.call_id
            );
            return Err(Overflow::new(queue, OverflowReason::QueueFull));
        }

        info!("📞 Enqueuing call {} to queue {}", call.call_id, queue.id);
        waiting.push_back(call);
        info!("📊 Queue {} size: {} calls", queue.id, waiting.len());
        Ok(waiting.len())
    }

    /// Remove a call from the waiting set (answered, abandoned or overflowed)
    pub fn dequeue(&self, queue_id: &str, call_id: &str) -> Option<WaitingCall> {
        let mut waiting = self.waiting.get_mut(queue_id)?;
        let pos = waiting.iter().position(|c| c.call_id == call_id)?;
        let call = waiting.remove(pos);
        debug!("📤 Call {} left queue {} ({} waiting)", call_id, queue_id, waiting.len());
        call
    }

    pub fn waiting_count(&self, queue_id: &str) -> usize {
        self.waiting.get(queue_id).map(|w| w.len()).unwrap_or(0)
    }

    pub fn waiting_calls(&self, queue_id: &str) -> Vec<WaitingCall> {
        self.waiting
            .get(queue_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queues that currently hold waiting calls
    pub fn waiting_queue_ids(&self) -> Vec<String> {
        self.waiting
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Overflow if the call has waited longer than the queue allows
    pub fn check_wait(&self, queue: &QueueDefinition, call_id: &str, now: DateTime<Utc>) -> Option<Overflow> {
        let waiting = self.waiting.get(&queue.id)?;
        let call = waiting.iter().find(|c| c.call_id == call_id)?;
        let waited = (now - call.entered_at).num_seconds();
        (waited >= 0 && waited as u64 >= queue.max_wait_time_secs)
            .then(|| Overflow::new(queue, OverflowReason::WaitTimeExceeded))
    }

    /// Select who to offer the call to, from the queue's members.
    ///
    /// On overflow the call is removed from the waiting set.
    pub fn distribute(
        &self,
        queue: &QueueDefinition,
        call: &WaitingCall,
        members: &[AgentCandidate],
    ) -> Distribution {
        let skill = call.required_skill.as_deref().or(queue.required_skill.as_deref());
        let eligible: Vec<AgentCandidate> = members
            .iter()
            .filter(|m| m.is_eligible(queue, skill))
            .cloned()
            .collect();

        let selected: Vec<String> = match queue.strategy {
            QueueStrategy::RingAll => {
                let mut all: Vec<&AgentCandidate> = eligible.iter().collect();
                all.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
                all.into_iter().map(|c| c.extension_id.clone()).collect()
            }
            QueueStrategy::LongestIdle => strategy::longest_idle(&eligible)
                .map(|c| vec![c.extension_id.clone()])
                .unwrap_or_default(),
            QueueStrategy::LeastTalkTime => strategy::least_talk_time(&eligible)
                .map(|c| vec![c.extension_id.clone()])
                .unwrap_or_default(),
            QueueStrategy::RoundRobin => self.select_round_robin(&queue.id, &eligible),
            QueueStrategy::Random => {
                let mut rng = self.rng.lock();
                strategy::random(&eligible, &mut *rng)
                    .map(|c| vec![c.extension_id.clone()])
                    .unwrap_or_default()
            }
        };

        if selected.is_empty() {
            warn!("⚠️ No eligible agents in queue {} for call {}", queue.id, call.call_id);
            self.dequeue(&queue.id, &call.call_id);
            return Distribution::Overflow(Overflow::new(queue, OverflowReason::NoEligibleAgents));
        }

        info!(
            "🎯 Queue {} ({:?}) offering call {} to {:?}",
            queue.id, queue.strategy, call.call_id, selected
        );
        Distribution::Offer(selected)
    }

    fn select_round_robin(&self, queue_id: &str, eligible: &[AgentCandidate]) -> Vec<String> {
        let cursor = self
            .cursors
            .entry(queue_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut last = cursor.lock();
        match strategy::round_robin(eligible, last.as_ref()) {
            Some(chosen) => {
                *last = Some((chosen.priority, chosen.extension_id.clone()));
                vec![chosen.extension_id.clone()]
            }
            None => Vec::new(),
        }
    }

    /// Forget a queue's waiting calls and cursor (queue deleted)
    pub fn reset_queue(&self, queue_id: &str) {
        self.waiting.remove(queue_id);
        self.cursors.remove(queue_id);
    }
}

impl Default for QueueDistributor {
    fn default() -> Self {
        Self::new()
    }
}
