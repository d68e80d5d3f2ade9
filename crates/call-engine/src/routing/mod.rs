//! # Call Routing Engine Module
//!
//! Resolves a dialed number to where the call should go.
//!
//! ```text
//!        inbound (from trunk)                 outbound (from extension)
//!   DID + trunk + caller number            dialed number + caller role
//!               │                                     │
//!   ┌───────────▼───────────┐             ┌───────────▼───────────┐
//!   │  InboundRule list     │             │  OutboundRule list    │
//!   │  by (priority, order) │             │  by (priority, order) │
//!   │  pattern, trunk scope │             │  pattern, role list   │
//!   │  caller filter, hours │             │  strip / prepend      │
//!   └───────────┬───────────┘             └───────────┬───────────┘
//!               │                                     │
//!     Destination or fallback          trunk (or one-hop backup),
//!                                      caller id, trunk slot lease
//! ```
//!
//! Rules are ordered by ascending `priority`; equal priorities keep creation
//! order. Only the first matching rule is used. Refusals are
//! [`NoRouteFound`](crate::error::CallEngineError::NoRouteFound) and
//! [`TrunkSaturated`](crate::error::CallEngineError::TrunkSaturated).

pub mod engine;
pub mod pattern;
pub mod trunk_usage;

pub use engine::{InboundRoute, OutboundRoute, RoutingEngine, rewrite_number};
pub use pattern::DialPattern;
pub use trunk_usage::{TrunkLease, TrunkUsage};
