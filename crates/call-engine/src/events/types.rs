//! Event envelope and payloads pushed to observers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::AgentStatus;
use crate::error::{CallEngineError, Result};
use crate::session::{CallSession, CallStateKind, Direction, HangupCause};

/// Channel carrying agent state changes
pub const AGENTS_CHANNEL: &str = "agents";

/// Channel carrying system alerts
pub const SYSTEM_CHANNEL: &str = "system";

const QUEUE_CHANNEL_PREFIX: &str = "queues:";

/// Event channel for a queue
pub fn queue_channel(queue_id: &str) -> String {
    format!("{}{}", QUEUE_CHANNEL_PREFIX, queue_id)
}

/// Check a channel name against `queues:<id>`, `agents` and `system`
pub fn validate_channel(name: &str) -> Result<()> {
    match name {
        AGENTS_CHANNEL | SYSTEM_CHANNEL => Ok(()),
        other => match other.strip_prefix(QUEUE_CHANNEL_PREFIX) {
            Some(queue_id) if !queue_id.is_empty() => Ok(()),
            _ => Err(CallEngineError::invalid_input(format!("unknown channel '{}'", name))),
        },
    }
}

/// Where an event is delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every connected observer
    Broadcast,
    /// Observers subscribed to the channel
    Channel(String),
}

impl Topic {
    pub fn channel(name: impl Into<String>) -> Self {
        Topic::Channel(name.into())
    }

    pub fn agents() -> Self {
        Topic::Channel(AGENTS_CHANNEL.to_string())
    }

    pub fn system() -> Self {
        Topic::Channel(SYSTEM_CHANNEL.to_string())
    }

    pub fn queue(queue_id: &str) -> Self {
        Topic::Channel(queue_channel(queue_id))
    }

    pub fn channel_name(&self) -> Option<&str> {
        match self {
            Topic::Broadcast => None,
            Topic::Channel(name) => Some(name),
        }
    }
}

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Connected,
    CallInitiated,
    CallRinging,
    CallAnswered,
    CallHeld,
    CallResumed,
    CallTransferred,
    CallEnded,
    CallDtmf,
    ExtensionRegistered,
    ExtensionUnregistered,
    QueueCallEntered,
    QueueStatsUpdated,
    AgentStateChanged,
    SystemAlert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "CONNECTED",
            EventKind::CallInitiated => "CALL_INITIATED",
            EventKind::CallRinging => "CALL_RINGING",
            EventKind::CallAnswered => "CALL_ANSWERED",
            EventKind::CallHeld => "CALL_HELD",
            EventKind::CallResumed => "CALL_RESUMED",
            EventKind::CallTransferred => "CALL_TRANSFERRED",
            EventKind::CallEnded => "CALL_ENDED",
            EventKind::CallDtmf => "CALL_DTMF",
            EventKind::ExtensionRegistered => "EXTENSION_REGISTERED",
            EventKind::ExtensionUnregistered => "EXTENSION_UNREGISTERED",
            EventKind::QueueCallEntered => "QUEUE_CALL_ENTERED",
            EventKind::QueueStatsUpdated => "QUEUE_STATS_UPDATED",
            EventKind::AgentStateChanged => "AGENT_STATE_CHANGED",
            EventKind::SystemAlert => "SYSTEM_ALERT",
        }
    }

    /// Event announcing that a call entered `to` from `from`
    pub fn for_transition(from: CallStateKind, to: CallStateKind) -> Self {
        match (from, to) {
            (_, CallStateKind::Initiated) => EventKind::CallInitiated,
            (_, CallStateKind::Ringing) => EventKind::CallRinging,
            (CallStateKind::Held, CallStateKind::Answered) => EventKind::CallResumed,
            (_, CallStateKind::Answered) => EventKind::CallAnswered,
            (_, CallStateKind::Held) => EventKind::CallHeld,
            (_, CallStateKind::Transferred) => EventKind::CallTransferred,
            (_, CallStateKind::Ended) => EventKind::CallEnded,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an observer receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventKind,
    /// `None` for broadcast events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Call transition payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEventPayload {
    pub call_id: String,
    pub direction: Direction,
    pub state: CallStateKind,
    pub caller_number: String,
    pub caller_name: Option<String>,
    pub caller_extension_id: Option<String>,
    pub callee_number: String,
    pub callee_name: Option<String>,
    pub callee_extension_id: Option<String>,
    pub trunk_id: Option<String>,
    pub presented_caller_id: Option<String>,
    pub queue_id: Option<String>,
    pub agent_extension_id: Option<String>,
    pub queue_wait_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub ringing_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hangup_cause: Option<HangupCause>,
    pub recording_id: Option<String>,
}

impl From<&CallSession> for CallEventPayload {
    fn from(s: &CallSession) -> Self {
        Self {
            call_id: s.call_id.clone(),
            direction: s.direction,
            state: s.kind(),
            caller_number: s.caller.number.clone(),
            caller_name: s.caller.display_name.clone(),
            caller_extension_id: s.caller.extension_id.clone(),
            callee_number: s.callee.number.clone(),
            callee_name: s.callee.display_name.clone(),
            callee_extension_id: s.callee.extension_id.clone(),
            trunk_id: s.trunk_id.clone(),
            presented_caller_id: s.presented_caller_id.clone(),
            queue_id: s.queue.as_ref().map(|q| q.queue_id.clone()),
            agent_extension_id: s.queue.as_ref().and_then(|q| q.agent_extension_id.clone()),
            queue_wait_secs: s.queue.as_ref().and_then(|q| q.wait_secs),
            created_at: s.created_at,
            ringing_at: s.ringing_at(),
            answered_at: s.answered_at(),
            ended_at: s.ended_at(),
            hangup_cause: s.hangup_cause(),
            recording_id: s.recording_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatePayload {
    pub extension_id: String,
    pub queue_id: String,
    pub status: AgentStatus,
    pub reason_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub extension_id: String,
    pub contact: String,
    pub transport: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Only on unregistration: `unregister` or `expired`
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCallEnteredPayload {
    pub queue_id: String,
    pub call_id: String,
    pub caller_number: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtmfPayload {
    pub call_id: String,
    pub digit: char,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAlertPayload {
    pub severity: String,
    pub message: String,
}
