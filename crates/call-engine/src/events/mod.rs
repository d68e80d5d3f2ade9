//! # Event Bus
//!
//! Best-effort, at-most-once delivery of state changes to operator consoles.
//!
//! Call and extension events go to every connected observer. Queue, agent and
//! system events go only to observers subscribed to `queues:<id>`, `agents` or
//! `system`. There is no replay: a reconnecting console must fetch a fresh
//! snapshot.

pub mod bus;
pub mod types;

pub use bus::{EventBus, ObserverAuthenticator, ObserverConnection, StaticTokenAuthenticator};
pub use types::{
    AGENTS_CHANNEL, AgentStatePayload, CallEventPayload, DtmfPayload, EventEnvelope, EventKind,
    QueueCallEnteredPayload, RegistrationPayload, SYSTEM_CHANNEL, SystemAlertPayload, Topic, queue_channel,
    validate_channel,
};
