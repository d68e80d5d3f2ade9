//! # PBX Call Engine
//!
//! Call control orchestrator for a software PBX. It sits between an external
//! SIP signaling engine, an external RTP media proxy and the PBX configuration,
//! and decides where every call goes, what state it is in and who gets told
//! about it.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────┐
//!  signaling ────▶│        CallEngine        │────▶ SignalingEngine commands
//!  events         │      (orchestrator)      │────▶ MediaProxy commands
//!                 └──┬──────┬──────┬──────┬──┘
//!                    │      │      │      │
//!      ┌─────────────▼┐ ┌───▼────┐ ┌▼──────────────┐ ┌▼─────────────┐
//!      │ Registration │ │Routing │ │    Queue      │ │   Session    │
//!      │  Directory   │ │ Engine │ │  Distributor  │ │   Registry   │
//!      └──────────────┘ └────────┘ └───────────────┘ └──────┬───────┘
//!                                                           │ transitions
//!                                      ┌────────────────────▼───────┐
//!                                      │ EventBus ▶ observers       │
//!                                      │ CallRecordStore (sqlx)     │
//!                                      └────────────────────────────┘
//! ```
//!
//! - [`orchestrator`]: the [`CallEngine`] and its signaling-event handlers
//! - [`routing`]: dial patterns, inbound/outbound rules, trunk capacity
//! - [`queue`]: waiting calls, agent selection strategies, statistics
//! - [`session`]: the call state machine and the live session registry
//! - [`events`]: observer authentication, channels and fan-out
//! - [`entities`]: PBX configuration (extensions, trunks, queues, rules)
//! - [`database`]: call record persistence
//! - [`integration`]: the signaling and media command sets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pbx_call_engine::prelude::*;
//!
//! # async fn example(
//! #     entities: Arc<dyn EntityStore>,
//! #     signaling: Arc<dyn SignalingEngine>,
//! #     media: Arc<dyn MediaProxy>,
//! # ) -> Result<()> {
//! let config = EngineConfig::from_file("pbx.toml")?;
//! setup_logging(&config.logging)?;
//!
//! let engine = CallEngine::builder(config)
//!     .with_entity_store(entities)
//!     .with_signaling(signaling)
//!     .with_media(media)
//!     .build()
//!     .await?;
//! engine.start_housekeeping();
//!
//! let call = engine
//!     .handle_invite(InviteRequest::new("abc@10.0.0.5", "+4930555", "+4930123456", "v=0").from_trunk("t1"))
//!     .await?;
//! println!("call {} is {}", call.call_id, call.kind());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod entities;
pub mod error;
pub mod events;
pub mod integration;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod routing;
pub mod session;
pub mod testing;

pub use config::EngineConfig;
pub use error::{CallEngineError, Result};
pub use orchestrator::{AnswerInfo, CallEngine, CallEngineBuilder, InviteRequest, RegisterRequest, RegisterResponse};

/// Convenient re-exports for embedding the engine
pub mod prelude {
    pub use crate::config::{EngineConfig, LogConfig};
    pub use crate::database::{CallRecordStore, InMemoryCallRecordStore, SqliteCallRecordStore};
    pub use crate::entities::{
        AgentState, AgentStatus, Destination, EntityStore, Extension, InMemoryEntityStore, InboundRule,
        OutboundRule, QueueDefinition, QueueMember, QueueStrategy, Role, Trunk,
    };
    pub use crate::error::{CallEngineError, Result};
    pub use crate::events::{EventBus, EventEnvelope, EventKind, ObserverConnection, Topic};
    pub use crate::integration::{MediaProxy, MediaResult, SignalingEngine};
    pub use crate::logging::setup_logging;
    pub use crate::orchestrator::{
        AnswerInfo, CallEngine, CallEngineBuilder, HousekeepingReport, InviteRequest, RegisterRequest,
        RegisterResponse,
    };
    pub use crate::queue::{QueueStats, ServiceLevel};
    pub use crate::session::{CallSession, CallStateKind, Direction, HangupCause, Party};
    pub use pbx_registrar_core::{ContactBinding, Registration, TransportKind};
}
