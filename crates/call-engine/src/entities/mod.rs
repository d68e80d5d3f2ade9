//! # PBX entities
//!
//! Read-side views of the persisted PBX configuration the orchestrator works
//! against: extensions, trunks, queues with their members and agent states,
//! and inbound/outbound routing rules. CRUD for these lives in an external
//! collaborator; the engine only sees them through [`EntityStore`].

pub mod store;
pub mod talk_time;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use pbx_registrar_core::TransportKind;

use crate::error::CallEngineError;

pub use store::{EntityStore, InMemoryEntityStore};
pub use talk_time::{InMemoryTalkTimeLedger, TalkTimeLedger};

/// Role of the user owning an extension; gates outbound rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Supervisor,
    Agent,
    User,
}

impl FromStr for Role {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "supervisor" => Ok(Role::Supervisor),
            "agent" => Ok(Role::Agent),
            "user" => Ok(Role::User),
            other => Err(CallEngineError::invalid_input(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Inactive,
}

/// An internal addressable endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub id: String,
    pub number: String,
    pub display_name: Option<String>,
    pub role: Role,
    /// Digest secret for REGISTER
    pub sip_password: Option<String>,
    pub status: EntityStatus,
}

impl Extension {
    pub fn new(id: impl Into<String>, number: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            number: number.into(),
            display_name: None,
            role,
            sip_password: None,
            status: EntityStatus::Active,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.sip_password = Some(password.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == EntityStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrunkStatus {
    Active,
    Inactive,
    Testing,
}

/// Carrier-facing SIP connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trunk {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub max_concurrent_calls: u32,
    pub backup_trunk_id: Option<String>,
    pub default_caller_id: Option<String>,
    pub status: TrunkStatus,
}

impl Trunk {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port: 5060,
            transport: TransportKind::Udp,
            max_concurrent_calls: 10,
            backup_trunk_id: None,
            default_caller_id: None,
            status: TrunkStatus::Active,
        }
    }

    /// Only active trunks carry traffic
    pub fn is_reachable(&self) -> bool {
        self.status == TrunkStatus::Active
    }
}

/// Where a routing decision sends a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Extension,
    Queue,
    Ivr,
    Voicemail,
    External,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DestinationKind::Extension => "extension",
            DestinationKind::Queue => "queue",
            DestinationKind::Ivr => "ivr",
            DestinationKind::Voicemail => "voicemail",
            DestinationKind::External => "external",
        };
        f.write_str(s)
    }
}

/// Destination descriptor: kind plus an entity id, or a number for `External`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub target: String,
}

impl Destination {
    pub fn extension(id: impl Into<String>) -> Self {
        Self { kind: DestinationKind::Extension, target: id.into() }
    }

    pub fn queue(id: impl Into<String>) -> Self {
        Self { kind: DestinationKind::Queue, target: id.into() }
    }

    pub fn ivr(id: impl Into<String>) -> Self {
        Self { kind: DestinationKind::Ivr, target: id.into() }
    }

    pub fn voicemail(id: impl Into<String>) -> Self {
        Self { kind: DestinationKind::Voicemail, target: id.into() }
    }

    pub fn external(number: impl Into<String>) -> Self {
        Self { kind: DestinationKind::External, target: number.into() }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)
    }
}

/// Weekly opening hours in a fixed UTC offset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub utc_offset_minutes: i32,
}

impl TimeWindow {
    /// Whether `now` falls inside the window. A window whose end is before its
    /// start runs overnight into the following day.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_minutes * 60) else {
            return false;
        };
        let local = now.with_timezone(&offset);
        let time = local.time();
        let today = local.weekday();

        if self.start <= self.end {
            self.days.contains(&today) && time >= self.start && time < self.end
        } else {
            (self.days.contains(&today) && time >= self.start)
                || (self.days.contains(&today.pred()) && time < self.end)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Active,
    Inactive,
}

/// DID-based routing for calls arriving from trunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRule {
    pub id: String,
    pub name: String,
    pub did_pattern: String,
    /// Only match calls arriving on this trunk
    pub trunk_id: Option<String>,
    /// Lower value is evaluated first
    pub priority: i32,
    /// Only match callers whose number matches this pattern
    pub caller_id_pattern: Option<String>,
    pub destination: Destination,
    pub time_window: Option<TimeWindow>,
    /// Used instead of `destination` outside the time window
    pub fallback: Option<Destination>,
    pub status: RuleStatus,
    /// Creation order, assigned by the store; breaks priority ties
    #[serde(default)]
    pub sequence: u64,
}

impl InboundRule {
    pub fn new(
        id: impl Into<String>,
        did_pattern: impl Into<String>,
        priority: i32,
        destination: Destination,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            did_pattern: did_pattern.into(),
            trunk_id: None,
            priority,
            caller_id_pattern: None,
            destination,
            time_window: None,
            fallback: None,
            status: RuleStatus::Active,
            sequence: 0,
        }
    }
}

/// How an outbound call presents its caller id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerIdMode {
    /// The originating extension's own number
    Extension,
    /// The rule's `custom_caller_id`
    Custom,
    /// The trunk's `default_caller_id`
    Trunk,
}

/// Dialed-number routing for calls leaving through trunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRule {
    pub id: String,
    pub name: String,
    pub number_pattern: String,
    /// Lower value is evaluated first
    pub priority: i32,
    /// Leading digits removed before `prepend` is applied
    pub strip_digits: usize,
    pub prepend: String,
    pub trunk_id: String,
    pub caller_id_mode: CallerIdMode,
    pub custom_caller_id: Option<String>,
    /// Roles allowed to use the rule; empty means every role
    pub allowed_roles: Vec<Role>,
    pub max_duration_secs: Option<u64>,
    pub status: RuleStatus,
    #[serde(default)]
    pub sequence: u64,
}

impl OutboundRule {
    pub fn new(
        id: impl Into<String>,
        number_pattern: impl Into<String>,
        priority: i32,
        trunk_id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            number_pattern: number_pattern.into(),
            priority,
            strip_digits: 0,
            prepend: String::new(),
            trunk_id: trunk_id.into(),
            caller_id_mode: CallerIdMode::Extension,
            custom_caller_id: None,
            allowed_roles: Vec::new(),
            max_duration_secs: None,
            status: RuleStatus::Active,
            sequence: 0,
        }
    }

    pub fn permits(&self, role: Option<Role>) -> bool {
        match role {
            // system-originated
            None => true,
            Some(role) => self.allowed_roles.is_empty() || self.allowed_roles.contains(&role),
        }
    }
}

/// Agent selection strategy of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    RingAll,
    LongestIdle,
    LeastTalkTime,
    RoundRobin,
    Random,
}

impl Default for QueueStrategy {
    fn default() -> Self {
        QueueStrategy::LongestIdle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowAction {
    Voicemail,
    Ivr,
    External,
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Active,
    Paused,
    Inactive,
}

/// Contact-center queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub id: String,
    pub name: String,
    pub strategy: QueueStrategy,
    /// Concurrently waiting calls beyond this overflow
    pub max_queue_size: usize,
    pub max_wait_time_secs: u64,
    pub service_level_threshold_secs: u64,
    /// Target share of calls answered within the threshold, in percent
    pub service_level_goal_percent: u8,
    pub wrap_up_time_secs: u64,
    pub overflow_action: OverflowAction,
    /// Voicemail box / IVR menu id, or external number
    pub overflow_destination: Option<String>,
    /// Skill required of agents for calls entering this queue
    pub required_skill: Option<String>,
    /// Members with a higher penalty are not offered calls
    pub max_member_penalty: Option<u32>,
    pub status: QueueStatus,
}

impl QueueDefinition {
    pub fn new(id: impl Into<String>, strategy: QueueStrategy) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            strategy,
            max_queue_size: 50,
            max_wait_time_secs: 300,
            service_level_threshold_secs: 20,
            service_level_goal_percent: 80,
            wrap_up_time_secs: 10,
            overflow_action: OverflowAction::Hangup,
            overflow_destination: None,
            required_skill: None,
            max_member_penalty: None,
            status: QueueStatus::Active,
        }
    }

    /// Event bus channel for this queue
    pub fn channel(&self) -> String {
        format!("queues:{}", self.id)
    }
}

/// (queue, extension) membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMember {
    pub queue_id: String,
    pub extension_id: String,
    /// Lower value is offered first by ordered strategies
    pub priority: i32,
    pub penalty: u32,
    pub skills: Vec<String>,
}

impl QueueMember {
    pub fn new(queue_id: impl Into<String>, extension_id: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
            extension_id: extension_id.into(),
            priority: 0,
            penalty: 0,
            skills: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    WrapUp,
    Break,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::WrapUp => "wrap_up",
            AgentStatus::Break => "break",
            AgentStatus::Offline => "offline",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = CallEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(AgentStatus::Available),
            "busy" => Ok(AgentStatus::Busy),
            "wrap_up" | "wrapup" => Ok(AgentStatus::WrapUp),
            "break" => Ok(AgentStatus::Break),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(CallEngineError::invalid_input(format!("unknown agent status '{}'", other))),
        }
    }
}

/// Availability of an agent in one queue; only the latest record matters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub extension_id: String,
    pub queue_id: String,
    pub status: AgentStatus,
    pub reason_code: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(
        extension_id: impl Into<String>,
        queue_id: impl Into<String>,
        status: AgentStatus,
        changed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            extension_id: extension_id.into(),
            queue_id: queue_id.into(),
            status,
            reason_code: None,
            changed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn business_hours() -> TimeWindow {
        TimeWindow {
            days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            utc_offset_minutes: 60,
        }
    }

    #[test]
    fn test_time_window_respects_offset() {
        let window = business_hours();
        // Monday 2024-01-15 08:30 UTC is 09:30 at +01:00
        let inside = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap();
        // 16:30 UTC is 17:30 local
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 16, 30, 0).unwrap();
        // Saturday
        let weekend = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();

        assert!(window.contains(inside));
        assert!(!window.contains(after));
        assert!(!window.contains(weekend));
    }

    #[test]
    fn test_overnight_window() {
        let window = TimeWindow {
            days: vec![Weekday::Fri],
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            utc_offset_minutes: 0,
        };
        let friday_late = Utc.with_ymd_and_hms(2024, 1, 19, 23, 0, 0).unwrap();
        let saturday_early = Utc.with_ymd_and_hms(2024, 1, 20, 5, 0, 0).unwrap();
        let saturday_late = Utc.with_ymd_and_hms(2024, 1, 20, 23, 0, 0).unwrap();

        assert!(window.contains(friday_late));
        assert!(window.contains(saturday_early));
        assert!(!window.contains(saturday_late));
    }

    #[test]
    fn test_outbound_rule_role_filter() {
        let mut rule = OutboundRule::new("r1", "0*", 10, "t1");
        assert!(rule.permits(Some(Role::User)));

        rule.allowed_roles = vec![Role::Admin, Role::Agent];
        assert!(rule.permits(Some(Role::Agent)));
        assert!(!rule.permits(Some(Role::User)));
        assert!(rule.permits(None));
    }

    #[test]
    fn test_queue_strategy_serde_names() {
        assert_eq!(serde_json::to_string(&QueueStrategy::LeastTalkTime).unwrap(), "\"least_talk_time\"");
        assert_eq!("wrap_up".parse::<AgentStatus>().unwrap(), AgentStatus::WrapUp);
    }
}
