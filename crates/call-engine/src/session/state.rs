//! Call session record and its state machine
//!
//! ```text
//!   Initiated ──► Ringing ──► Answered ◄──► Held
//!       │            │           │
//!       │            │           ▼
//!       │            │       Transferred
//!       ▼            ▼           │
//!     Ended ◄──────────────────────  (from every non-terminal state)
//! ```
//!
//! [`SessionState`] only carries the timestamps that are meaningful in each
//! state, so a session can never claim an `answered_at` it did not reach or
//! a hangup cause before it ended.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CallEngineError, Result};

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

impl Direction {
    /// Internal if both ends are known extensions, outbound if only the
    /// caller is, inbound otherwise.
    pub fn classify(caller_is_extension: bool, callee_is_extension: bool) -> Self {
        match (caller_is_extension, callee_is_extension) {
            (true, true) => Direction::Internal,
            (true, false) => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Internal => "internal",
        }
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HangupCause {
    NormalClearing,
    Busy,
    NoAnswer,
    Cancel,
    Rejected,
    Failed,
    Timeout,
}

impl HangupCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            HangupCause::NormalClearing => "normal-clearing",
            HangupCause::Busy => "busy",
            HangupCause::NoAnswer => "no-answer",
            HangupCause::Cancel => "cancel",
            HangupCause::Rejected => "rejected",
            HangupCause::Failed => "failed",
            HangupCause::Timeout => "timeout",
        }
    }

    /// Cause for a final SIP failure response on an outbound leg
    pub fn from_sip_status(status: u16) -> Self {
        match status {
            486 | 600 => HangupCause::Busy,
            408 | 480 => HangupCause::NoAnswer,
            403 | 603 => HangupCause::Rejected,
            487 => HangupCause::Cancel,
            _ => HangupCause::Failed,
        }
    }
}

impl fmt::Display for HangupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a call, with only the timestamps that state has reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Initiated,
    Ringing {
        ringing_at: DateTime<Utc>,
    },
    Answered {
        ringing_at: DateTime<Utc>,
        answered_at: DateTime<Utc>,
    },
    Held {
        ringing_at: DateTime<Utc>,
        answered_at: DateTime<Utc>,
        held_at: DateTime<Utc>,
    },
    Transferred {
        ringing_at: DateTime<Utc>,
        answered_at: DateTime<Utc>,
        transferred_at: DateTime<Utc>,
    },
    Ended {
        ringing_at: Option<DateTime<Utc>>,
        answered_at: Option<DateTime<Utc>>,
        ended_at: DateTime<Utc>,
        cause: HangupCause,
    },
}

/// Fieldless view of [`SessionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStateKind {
    Initiated,
    Ringing,
    Answered,
    Held,
    Transferred,
    Ended,
}

impl CallStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStateKind::Initiated => "initiated",
            CallStateKind::Ringing => "ringing",
            CallStateKind::Answered => "answered",
            CallStateKind::Held => "held",
            CallStateKind::Transferred => "transferred",
            CallStateKind::Ended => "ended",
        }
    }
}

impl fmt::Display for CallStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionState {
    pub fn kind(&self) -> CallStateKind {
        match self {
            SessionState::Initiated => CallStateKind::Initiated,
            SessionState::Ringing { .. } => CallStateKind::Ringing,
            SessionState::Answered { .. } => CallStateKind::Answered,
            SessionState::Held { .. } => CallStateKind::Held,
            SessionState::Transferred { .. } => CallStateKind::Transferred,
            SessionState::Ended { .. } => CallStateKind::Ended,
        }
    }

    pub fn ringing_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SessionState::Initiated => None,
            SessionState::Ringing { ringing_at }
            | SessionState::Answered { ringing_at, .. }
            | SessionState::Held { ringing_at, .. }
            | SessionState::Transferred { ringing_at, .. } => Some(*ringing_at),
            SessionState::Ended { ringing_at, .. } => *ringing_at,
        }
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SessionState::Initiated | SessionState::Ringing { .. } => None,
            SessionState::Answered { answered_at, .. }
            | SessionState::Held { answered_at, .. }
            | SessionState::Transferred { answered_at, .. } => Some(*answered_at),
            SessionState::Ended { answered_at, .. } => *answered_at,
        }
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SessionState::Ended { ended_at, .. } => Some(*ended_at),
            _ => None,
        }
    }

    pub fn hangup_cause(&self) -> Option<HangupCause> {
        match self {
            SessionState::Ended { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, SessionState::Ended { .. })
    }

    /// Latest timestamp recorded so far
    fn latest(&self) -> Option<DateTime<Utc>> {
        match self {
            SessionState::Initiated => None,
            SessionState::Ringing { ringing_at } => Some(*ringing_at),
            SessionState::Answered { answered_at, .. } => Some(*answered_at),
            SessionState::Held { held_at, .. } => Some(*held_at),
            SessionState::Transferred { transferred_at, .. } => Some(*transferred_at),
            SessionState::Ended { ended_at, .. } => Some(*ended_at),
        }
    }
}

/// Signaling-level input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ring,
    Answer,
    Hold,
    Resume,
    /// Blind transfer completed towards `target`
    Transfer { target: Party },
    End(HangupCause),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Ring => "ring",
            SessionEvent::Answer => "answer",
            SessionEvent::Hold => "hold",
            SessionEvent::Resume => "resume",
            SessionEvent::Transfer { .. } => "transfer",
            SessionEvent::End(_) => "end",
        }
    }
}

/// Result of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: CallStateKind, to: CallStateKind },
    /// Duplicate or late signal; nothing was written
    Unchanged,
}

impl Transition {
    pub fn is_changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

/// One end of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub number: String,
    pub display_name: Option<String>,
    /// Set when the number resolved to a known extension
    pub extension_id: Option<String>,
}

impl Party {
    pub fn number(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            display_name: None,
            extension_id: None,
        }
    }

    pub fn extension(number: impl Into<String>, extension_id: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            display_name: None,
            extension_id: Some(extension_id.into()),
        }
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    pub fn is_extension(&self) -> bool {
        self.extension_id.is_some()
    }
}

/// Queue context of a call that entered a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueLinkage {
    pub queue_id: String,
    pub entered_at: DateTime<Utc>,
    /// Agents the call is currently offered to
    pub offered_to: Vec<String>,
    /// Agent who answered
    pub agent_extension_id: Option<String>,
    /// answered_at minus entered_at, set on answer
    pub wait_secs: Option<f64>,
}

impl QueueLinkage {
    pub fn new(queue_id: impl Into<String>, entered_at: DateTime<Utc>) -> Self {
        Self {
            queue_id: queue_id.into(),
            entered_at,
            offered_to: Vec::new(),
            agent_extension_id: None,
            wait_secs: None,
        }
    }
}

/// One live call attempt or conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub direction: Direction,
    pub caller: Party,
    pub callee: Party,
    /// Trunk of the external leg
    pub trunk_id: Option<String>,
    /// Caller id shown to the far end of an outbound trunk leg
    #[serde(default)]
    pub presented_caller_id: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub queue: Option<QueueLinkage>,
    pub recording_id: Option<String>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        direction: Direction,
        caller: Party,
        callee: Party,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            direction,
            caller,
            callee,
            trunk_id: None,
            presented_caller_id: None,
            state: SessionState::Initiated,
            created_at,
            queue: None,
            recording_id: None,
        }
    }

    pub fn kind(&self) -> CallStateKind {
        self.state.kind()
    }

    pub fn ringing_at(&self) -> Option<DateTime<Utc>> {
        self.state.ringing_at()
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        self.state.answered_at()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.ended_at()
    }

    pub fn hangup_cause(&self) -> Option<HangupCause> {
        self.state.hangup_cause()
    }

    pub fn is_ended(&self) -> bool {
        self.state.is_ended()
    }

    /// Seconds between answer and end, for talk-time accounting
    pub fn talk_secs(&self) -> Option<u64> {
        let answered = self.answered_at()?;
        let ended = self.ended_at()?;
        Some((ended - answered).num_seconds().max(0) as u64)
    }

    /// Advance the state machine.
    ///
    /// Timestamps never go backwards: an event stamped earlier than the last
    /// transition is recorded at the last transition's time.
    pub fn apply(&mut self, event: SessionEvent, at: DateTime<Utc>) -> Result<Transition> {
        let from = self.state.kind();
        let at = match self.state.latest() {
            Some(last) if at < last => last,
            _ => at,
        };
        let created_at = self.created_at;
        let at = at.max(created_at);

        let next = match (&self.state, event) {
            (SessionState::Ended { .. }, SessionEvent::End(_)) => return Ok(Transition::Unchanged),
            (SessionState::Ended { .. }, event) => {
                return Err(CallEngineError::invalid_state(format!(
                    "call {} already ended, ignoring {}",
                    self.call_id,
                    event.name()
                )));
            }

            (_, SessionEvent::End(cause)) => SessionState::Ended {
                ringing_at: self.state.ringing_at(),
                answered_at: self.state.answered_at(),
                ended_at: at,
                cause,
            },

            (SessionState::Initiated, SessionEvent::Ring) => SessionState::Ringing { ringing_at: at },
            (_, SessionEvent::Ring) => return Ok(Transition::Unchanged),

            (SessionState::Ringing { ringing_at }, SessionEvent::Answer) => SessionState::Answered {
                ringing_at: *ringing_at,
                answered_at: at,
            },
            (
                SessionState::Answered { .. } | SessionState::Held { .. } | SessionState::Transferred { .. },
                SessionEvent::Answer,
            ) => return Ok(Transition::Unchanged),

            (SessionState::Answered { ringing_at, answered_at }, SessionEvent::Hold) => SessionState::Held {
                ringing_at: *ringing_at,
                answered_at: *answered_at,
                held_at: at,
            },
            (SessionState::Held { .. }, SessionEvent::Hold) => return Ok(Transition::Unchanged),

            (SessionState::Held { ringing_at, answered_at, .. }, SessionEvent::Resume) => {
                SessionState::Answered {
                    ringing_at: *ringing_at,
                    answered_at: *answered_at,
                }
            }
            (SessionState::Answered { .. }, SessionEvent::Resume) => return Ok(Transition::Unchanged),

            (SessionState::Answered { ringing_at, answered_at }, SessionEvent::Transfer { target }) => {
                let next = SessionState::Transferred {
                    ringing_at: *ringing_at,
                    answered_at: *answered_at,
                    transferred_at: at,
                };
                self.callee = target;
                next
            }

            (state, event) => {
                return Err(CallEngineError::InvalidTransition {
                    from: state.kind().to_string(),
                    event: event.name().to_string(),
                });
            }
        };

        self.state = next;
        Ok(Transition::Changed {
            from,
            to: self.state.kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn session(t0: DateTime<Utc>) -> CallSession {
        CallSession::new(
            "call-1",
            Direction::Internal,
            Party::extension("100", "e100"),
            Party::extension("200", "e200"),
            t0,
        )
    }

    #[test]
    fn test_direction_classification() {
        assert_eq!(Direction::classify(true, true), Direction::Internal);
        assert_eq!(Direction::classify(true, false), Direction::Outbound);
        assert_eq!(Direction::classify(false, true), Direction::Inbound);
        assert_eq!(Direction::classify(false, false), Direction::Inbound);
    }

    #[test]
    fn test_full_lifecycle_timestamps() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.apply(SessionEvent::Ring, t0 + Duration::seconds(1)).unwrap();
        s.apply(SessionEvent::Answer, t0 + Duration::seconds(4)).unwrap();
        s.apply(SessionEvent::Hold, t0 + Duration::seconds(10)).unwrap();
        s.apply(SessionEvent::Resume, t0 + Duration::seconds(20)).unwrap();
        s.apply(SessionEvent::End(HangupCause::NormalClearing), t0 + Duration::seconds(64))
            .unwrap();

        assert_eq!(s.ringing_at(), Some(t0 + Duration::seconds(1)));
        assert_eq!(s.answered_at(), Some(t0 + Duration::seconds(4)));
        assert_eq!(s.ended_at(), Some(t0 + Duration::seconds(64)));
        assert_eq!(s.talk_secs(), Some(60));
        assert_eq!(s.hangup_cause(), Some(HangupCause::NormalClearing));
    }

    #[test]
    fn test_answer_requires_ringing() {
        let t0 = Utc::now();
        let mut s = session(t0);
        let err = s.apply(SessionEvent::Answer, t0).unwrap_err();
        assert!(matches!(err, CallEngineError::InvalidTransition { .. }));
        assert_eq!(s.kind(), CallStateKind::Initiated);
    }

    #[test]
    fn test_duplicate_ring_is_noop() {
        let t0 = Utc::now();
        let mut s = session(t0);
        assert!(s.apply(SessionEvent::Ring, t0).unwrap().is_changed());
        assert_eq!(s.apply(SessionEvent::Ring, t0 + Duration::seconds(3)).unwrap(), Transition::Unchanged);
        assert_eq!(s.ringing_at(), Some(t0));
    }

    #[test]
    fn test_second_end_is_noop_and_keeps_cause() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.apply(SessionEvent::End(HangupCause::Cancel), t0).unwrap();
        let again = s.apply(SessionEvent::End(HangupCause::NormalClearing), t0 + Duration::seconds(1));
        assert_eq!(again.unwrap(), Transition::Unchanged);
        assert_eq!(s.hangup_cause(), Some(HangupCause::Cancel));
    }

    #[test]
    fn test_events_after_end_are_invalid_state() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.apply(SessionEvent::End(HangupCause::Failed), t0).unwrap();
        for event in [SessionEvent::Ring, SessionEvent::Answer, SessionEvent::Hold] {
            assert!(matches!(s.apply(event, t0).unwrap_err(), CallEngineError::InvalidState(_)));
        }
        assert_eq!(s.ringing_at(), None);
    }

    #[test]
    fn test_transfer_repoints_callee() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.apply(SessionEvent::Ring, t0).unwrap();

        let target = Party::extension("300", "e300");
        let early = s.apply(SessionEvent::Transfer { target: target.clone() }, t0).unwrap_err();
        assert!(matches!(early, CallEngineError::InvalidTransition { .. }));

        s.apply(SessionEvent::Answer, t0).unwrap();
        s.apply(SessionEvent::Transfer { target: target.clone() }, t0).unwrap();
        assert_eq!(s.kind(), CallStateKind::Transferred);
        assert_eq!(s.callee, target);

        let err = s.apply(SessionEvent::Hold, t0).unwrap_err();
        assert!(matches!(err, CallEngineError::InvalidTransition { .. }));
        s.apply(SessionEvent::End(HangupCause::NormalClearing), t0).unwrap();
        assert!(s.answered_at().is_some());
    }

    #[test]
    fn test_timestamps_stay_monotonic() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.apply(SessionEvent::Ring, t0 + Duration::seconds(5)).unwrap();
        // stamped before ringing
        s.apply(SessionEvent::Answer, t0 + Duration::seconds(2)).unwrap();
        s.apply(SessionEvent::End(HangupCause::NormalClearing), t0).unwrap();

        let ringing = s.ringing_at().unwrap();
        let answered = s.answered_at().unwrap();
        let ended = s.ended_at().unwrap();
        assert!(ringing <= answered && answered <= ended);
    }

    #[test]
    fn test_sip_status_mapping() {
        assert_eq!(HangupCause::from_sip_status(486), HangupCause::Busy);
        assert_eq!(HangupCause::from_sip_status(480), HangupCause::NoAnswer);
        assert_eq!(HangupCause::from_sip_status(408), HangupCause::NoAnswer);
        assert_eq!(HangupCause::from_sip_status(603), HangupCause::Rejected);
        assert_eq!(HangupCause::from_sip_status(403), HangupCause::Rejected);
        assert_eq!(HangupCause::from_sip_status(503), HangupCause::Failed);
    }

    #[test]
    fn test_state_serializes_tagged() {
        let t0 = Utc::now();
        let mut s = session(t0);
        s.apply(SessionEvent::End(HangupCause::NoAnswer), t0).unwrap();
        let json = serde_json::to_value(&s.state).unwrap();
        assert_eq!(json["state"], "ended");
        assert_eq!(json["cause"], "no-answer");
        let back: CallSession = serde_json::from_value(serde_json::to_value(&s).unwrap()).unwrap();
        assert_eq!(back, s);
    }
}
