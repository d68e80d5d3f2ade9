//! # Queue Distribution Engine
//!
//! Selects which agents a waiting call is offered to.
//!
//! ```text
//!   waiting call ──► QueueDistributor::enqueue ──► Overflow(queue full / paused)
//!        │
//!        ▼
//!   members + latest agent state + talk time
//!        │  filter: available, required skill, penalty cap
//!        ▼
//!   strategy: ring_all | longest_idle | least_talk_time | round_robin | random
//!        │
//!        ├──► Offer([agents])
//!        └──► Overflow(no eligible agents / wait exceeded)
//! ```
//!
//! Service level is derived afterwards from completed sessions and never feeds
//! back into selection.

pub mod distributor;
pub mod stats;
pub mod strategy;

pub use distributor::{Distribution, Overflow, OverflowReason, QueueDistributor, WaitingCall};
pub use stats::{QueueStats, ServiceLevel};
pub use strategy::AgentCandidate;
