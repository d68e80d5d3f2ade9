//! # Call Control Orchestration
//!
//! The orchestrator is the heart of the PBX: it receives signaling events
//! (REGISTER, INVITE, provisional and final responses, BYE, CANCEL, DTMF),
//! consults the registration directory, routing engine and queue distributor,
//! drives the call session state machine, commands the external signaling
//! engine and media proxy, and publishes everything it does on the event bus.
//!
//! ## Module Organization
//!
//! - **[`core`]**: [`CallEngine`] and its builder
//! - **[`registration`]**: REGISTER with digest authentication
//! - **[`calls`]**: INVITE admission, answer, hold, transfer and teardown
//! - **[`agents`]**: agent login/logout, agent state and queue statistics
//! - **[`housekeeping`]**: periodic expiry sweeps
//! - **[`uri_builder`]**: SIP URI generation from configuration
//!
//! ## Call Flow
//!
//! ```text
//! INVITE ──▶ admit ──▶ route ──▶ media offer ──▶ dispatch ──▶ ringing
//!             │          │                          │
//!             │          │ no route / saturated     ├─ extension: registered contact
//!             ▼          ▼                          ├─ queue: enqueue + distribute
//!          ended(failed) ◀──────────────────────────├─ ivr / voicemail: app host
//!                                                   └─ external: trunk
//! 200 OK ──▶ media answer ──▶ accept ──▶ answered ──▶ (hold ⇄ resume | transfer)
//! BYE / CANCEL / 4xx-6xx / timers ──▶ finalize ──▶ ended
//! ```
//!
//! Every collaborator command is bounded by a configured timeout; a timeout
//! is a transport failure and ends the call with cause `failed`.

pub mod agents;
pub mod calls;
pub mod core;
pub mod housekeeping;
pub mod registration;
pub mod uri_builder;

pub use calls::{AnswerInfo, InviteRequest};
pub use core::{CallEngine, CallEngineBuilder};
pub use housekeeping::HousekeepingReport;
pub use registration::{RegisterRequest, RegisterResponse};
pub use uri_builder::SipUriBuilder;
