//! Periodic housekeeping
//!
//! One background task sweeps expired registrations and digest nonces, drops
//! ended sessions past their retention, and overflows queue calls whose wait
//! limit passed without their timer firing (e.g. after a clock jump).

use chrono::Duration as ChronoDuration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use pbx_registrar_core::RemovalReason;

use super::core::CallEngine;
use crate::integration::bounded;

/// What one housekeeping pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub expired_registrations: usize,
    pub purged_nonces: usize,
    pub pruned_sessions: usize,
    pub overflowed_calls: usize,
}

impl HousekeepingReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl CallEngine {
    /// Start the housekeeping task; a second call is a no-op
    pub fn start_housekeeping(&self) {
        let mut task = self.housekeeping.lock();
        if task.is_some() {
            return;
        }

        let engine = self.clone();
        let period = self.config.housekeeping.sweep_interval();
        info!("🧹 Housekeeping every {:?}", period);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = engine.run_housekeeping_pass().await;
                if !report.is_empty() {
                    debug!("🧹 Housekeeping: {:?}", report);
                }
            }
        }));
    }

    /// Stop background work. Live calls are left as they are.
    pub fn shutdown(&self) {
        if let Some(task) = self.housekeeping.lock().take() {
            task.abort();
            info!("🛑 Housekeeping stopped");
        }
    }

    pub async fn run_housekeeping_pass(&self) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();

        for registration in self.directory.sweep_expired() {
            info!(
                "⌛ Registration of {} at {} expired",
                registration.extension_id, registration.contact
            );
            self.publish_unregistered(&registration, RemovalReason::Expired);
            report.expired_registrations += 1;
        }

        report.purged_nonces = self.digest.purge_expired();

        let retention = ChronoDuration::seconds(self.config.housekeeping.ended_session_retention_secs as i64);
        report.pruned_sessions = self.sessions.prune_ended(self.clock.now() - retention);

        report.overflowed_calls = self.overflow_stale_waiting_calls().await;
        report
    }

    async fn overflow_stale_waiting_calls(&self) -> usize {
        let now = self.clock.now();
        let mut overflowed = 0;

        for queue_id in self.distributor.waiting_queue_ids() {
            let queue = match bounded(
                "find_queue",
                &queue_id,
                self.store_timeout(),
                self.entities.find_queue(&queue_id),
            )
            .await
            {
                Ok(queue) => queue,
                Err(e) => {
                    warn!("Housekeeping skipped queue {}: {}", queue_id, e);
                    continue;
                }
            };

            for call in self.distributor.waiting_calls(&queue_id) {
                if self.distributor.check_wait(&queue, &call.call_id, now).is_none() {
                    continue;
                }
                let Ok(handle) = self.sessions.get(&call.call_id) else {
                    // session gone; drop the orphaned entry
                    self.distributor.dequeue(&queue_id, &call.call_id);
                    continue;
                };
                if handle.is_terminating() {
                    continue;
                }
                let mut slot = handle.lock().await;
                if self.overflow_waiting_call(&mut slot, &queue_id).await {
                    overflowed += 1;
                }
            }
        }
        overflowed
    }
}
