//! # Call Session State Machine
//!
//! One [`CallSession`] record per call attempt, advanced only through
//! [`CallSession::apply`]. The orchestrator keeps live sessions in a
//! [`SessionRegistry`] and mutates each under its own lock.

pub mod registry;
pub mod state;

pub use registry::{SessionHandle, SessionRegistry, SessionSlot};
pub use state::{
    CallSession, CallStateKind, Direction, HangupCause, Party, QueueLinkage, SessionEvent, SessionState,
    Transition,
};
