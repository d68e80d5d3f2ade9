//! Per-agent talk-time accumulator used by `least_talk_time`

use async_trait::async_trait;
use dashmap::DashMap;

/// Cumulative answered-call duration per agent since shift start
#[async_trait]
pub trait TalkTimeLedger: Send + Sync {
    async fn talk_time_secs(&self, extension_id: &str) -> u64;

    async fn add_talk_time(&self, extension_id: &str, secs: u64);

    /// Start a new shift
    async fn reset(&self, extension_id: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryTalkTimeLedger {
    totals: DashMap<String, u64>,
}

impl InMemoryTalkTimeLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TalkTimeLedger for InMemoryTalkTimeLedger {
    async fn talk_time_secs(&self, extension_id: &str) -> u64 {
        self.totals.get(extension_id).map(|v| *v).unwrap_or(0)
    }

    async fn add_talk_time(&self, extension_id: &str, secs: u64) {
        *self.totals.entry(extension_id.to_string()).or_insert(0) += secs;
    }

    async fn reset(&self, extension_id: &str) {
        self.totals.remove(extension_id);
    }
}
