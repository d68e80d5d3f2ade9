//! SQLite call record store (sqlx)

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use super::CallRecordStore;
use crate::config::DatabaseConfig;
use crate::error::{CallEngineError, Result};
use crate::session::CallSession;

const CREATE_CALL_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS call_records (
    call_id TEXT PRIMARY KEY,
    direction TEXT NOT NULL,
    state TEXT NOT NULL,
    caller_number TEXT NOT NULL,
    callee_number TEXT NOT NULL,
    queue_id TEXT,
    hangup_cause TEXT,
    created_at TEXT NOT NULL,
    answered_at TEXT,
    ended_at TEXT,
    record_json TEXT NOT NULL
)
"#;

const CREATE_QUEUE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_call_records_queue ON call_records (queue_id, state)";

/// Call records in a SQLite database
#[derive(Clone)]
pub struct SqliteCallRecordStore {
    pool: SqlitePool,
}

impl SqliteCallRecordStore {
    /// Open (creating if needed) the database at `url` and ensure the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        info!("🗄️ Opening call record database at {}", url);
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // every connection to :memory: is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CallEngineError::config("database.url is not set"))?;
        Self::connect(url, config.max_connections).await
    }

    /// In-memory database, for tests
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("📋 Creating call_records table");
        sqlx::query(CREATE_CALL_RECORDS).execute(&self.pool).await?;
        sqlx::query(CREATE_QUEUE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CallRecordStore for SqliteCallRecordStore {
    async fn save(&self, session: &CallSession) -> Result<()> {
        let record_json = serde_json::to_string(session)?;
        sqlx::query(
            "INSERT INTO call_records (call_id, direction, state, caller_number, callee_number, queue_id,
                                       hangup_cause, created_at, answered_at, ended_at, record_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(call_id) DO UPDATE SET
                direction = excluded.direction,
                state = excluded.state,
                callee_number = excluded.callee_number,
                queue_id = excluded.queue_id,
                hangup_cause = excluded.hangup_cause,
                answered_at = excluded.answered_at,
                ended_at = excluded.ended_at,
                record_json = excluded.record_json",
        )
        .bind(&session.call_id)
        .bind(session.direction.as_str())
        .bind(session.kind().as_str())
        .bind(&session.caller.number)
        .bind(&session.callee.number)
        .bind(session.queue.as_ref().map(|q| q.queue_id.clone()))
        .bind(session.hangup_cause().map(|c| c.as_str()))
        .bind(session.created_at.to_rfc3339())
        .bind(session.answered_at().map(|t| t.to_rfc3339()))
        .bind(session.ended_at().map(|t| t.to_rfc3339()))
        .bind(record_json)
        .execute(&self.pool)
        .await?;

        debug!("Call record {} saved ({})", session.call_id, session.kind());
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallSession>> {
        let row = sqlx::query("SELECT record_json FROM call_records WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("record_json")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn completed_for_queue(&self, queue_id: &str) -> Result<Vec<CallSession>> {
        let rows = sqlx::query(
            "SELECT record_json FROM call_records
             WHERE queue_id = ? AND state = 'ended'
             ORDER BY created_at ASC",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<CallSession> {
                let json: String = row.try_get("record_json")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }
}
