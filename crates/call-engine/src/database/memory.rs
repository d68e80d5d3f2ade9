//! In-process call record store

use async_trait::async_trait;
use dashmap::DashMap;

use super::CallRecordStore;
use crate::error::Result;
use crate::session::CallSession;

#[derive(Debug, Default)]
pub struct InMemoryCallRecordStore {
    records: DashMap<String, CallSession>,
}

impl InMemoryCallRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl CallRecordStore for InMemoryCallRecordStore {
    async fn save(&self, session: &CallSession) -> Result<()> {
        self.records.insert(session.call_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallSession>> {
        Ok(self.records.get(call_id).map(|r| r.value().clone()))
    }

    async fn completed_for_queue(&self, queue_id: &str) -> Result<Vec<CallSession>> {
        let mut sessions: Vec<CallSession> = self
            .records
            .iter()
            .filter(|r| r.is_ended() && r.queue.as_ref().is_some_and(|q| q.queue_id == queue_id))
            .map(|r| r.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}
