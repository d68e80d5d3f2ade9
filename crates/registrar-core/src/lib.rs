//! # PBX Registrar Core
//!
//! Registration directory and REGISTER authentication for the PBX call engine.
//!
//! The crate answers one question for the rest of the system: *where can extension
//! X be reached right now?* It keeps exactly one current contact binding per
//! extension, expires bindings passively, and verifies SIP digest credentials
//! before a binding is accepted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────┐
//! │     REGISTER handler         │─────▶│   DigestAuthenticator    │
//! │  (call-engine orchestrator)  │      │  nonce issue / verify    │
//! └──────────────┬───────────────┘      └──────────────────────────┘
//!                │ register / unregister
//! ┌──────────────▼───────────────┐      ┌──────────────────────────┐
//! │    RegistrationDirectory     │─────▶│    ExtensionCatalog      │
//! │  DashMap<extension, binding> │      │  (entity collaborator)   │
//! └──────────────┬───────────────┘      └──────────────────────────┘
//!                │ lookup / sweep_expired
//!        routing + housekeeping
//! ```
//!
//! All time-dependent behavior reads a [`Clock`](clock::Clock), so expiry can
//! be driven deterministically in tests with [`ManualClock`](clock::ManualClock).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pbx_registrar_core::prelude::*;
//!
//! # async fn example(catalog: Arc<dyn ExtensionCatalog>) -> Result<()> {
//! let directory = RegistrationDirectory::new(RegistrarConfig::default(), catalog);
//!
//! let binding = ContactBinding::new("sip:100@10.0.0.5:5060", "10.0.0.5", 5060, TransportKind::Udp);
//! directory.register("ext-100", binding, 3600).await?;
//!
//! if let Some(reg) = directory.lookup("ext-100") {
//!     println!("ext-100 reachable at {}", reg.contact);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod registrar;
pub mod types;

pub use auth::{DigestAuthenticator, DigestChallenge, DigestCredentials};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RegistrarConfig;
pub use error::{RegistrarError, Result};
pub use registrar::{ExtensionCatalog, RegistrationDirectory, RegistrationOutcome};
pub use types::{ContactBinding, Registration, RemovalReason, TransportKind};

/// Convenient re-exports for registrar users
pub mod prelude {
    pub use crate::auth::{DigestAuthenticator, DigestChallenge, DigestCredentials};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::RegistrarConfig;
    pub use crate::error::{RegistrarError, Result};
    pub use crate::registrar::{ExtensionCatalog, RegistrationDirectory, RegistrationOutcome};
    pub use crate::types::{ContactBinding, Registration, RemovalReason, TransportKind};
}
