//! # Call record persistence
//!
//! Every state transition of a call session is upserted by call id, so a
//! crashed engine leaves the last known state behind and reporting can read
//! completed sessions without touching the live registry.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::CallSession;

pub use memory::InMemoryCallRecordStore;
pub use sqlite::SqliteCallRecordStore;

/// Storage for call session records
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Insert or replace the record for `session.call_id`
    async fn save(&self, session: &CallSession) -> Result<()>;

    async fn get(&self, call_id: &str) -> Result<Option<CallSession>>;

    /// Ended sessions that passed through `queue_id`, oldest first
    async fn completed_for_queue(&self, queue_id: &str) -> Result<Vec<CallSession>>;
}
