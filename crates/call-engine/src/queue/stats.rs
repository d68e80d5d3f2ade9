//! Read-side queue statistics

use serde::{Deserialize, Serialize};

use crate::entities::QueueDefinition;
use crate::session::CallSession;

/// Live counters for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_id: String,
    pub queue_name: String,
    /// Calls waiting for an agent
    pub waiting_calls: usize,
    /// Calls from this queue that an agent has answered and not yet ended
    pub active_calls: usize,
    pub available_agents: usize,
    pub busy_agents: usize,
    pub wrap_up_agents: usize,
}

/// Share of answered queue calls that waited at most the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLevel {
    pub queue_id: String,
    pub threshold_secs: u64,
    pub answered: usize,
    pub within_threshold: usize,
    /// `None` until at least one call was answered
    pub ratio: Option<f64>,
    pub goal_percent: u8,
}

impl ServiceLevel {
    /// Compute over completed sessions. Sessions from other queues and
    /// sessions that were never answered are ignored.
    pub fn compute<'a>(queue: &QueueDefinition, sessions: impl IntoIterator<Item = &'a CallSession>) -> Self {
        let threshold = queue.service_level_threshold_secs as f64;
        let mut answered = 0;
        let mut within_threshold = 0;

        for session in sessions {
            let Some(link) = session.queue.as_ref() else {
                continue;
            };
            if link.queue_id != queue.id || session.answered_at().is_none() {
                continue;
            }
            let Some(wait) = link.wait_secs else {
                continue;
            };
            answered += 1;
            if wait <= threshold {
                within_threshold += 1;
            }
        }

        Self {
            queue_id: queue.id.clone(),
            threshold_secs: queue.service_level_threshold_secs,
            answered,
            within_threshold,
            ratio: (answered > 0).then(|| within_threshold as f64 / answered as f64),
            goal_percent: queue.service_level_goal_percent,
        }
    }

    pub fn meets_goal(&self) -> bool {
        match self.ratio {
            Some(ratio) => ratio * 100.0 >= f64::from(self.goal_percent),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::QueueStrategy;
    use crate::session::{Direction, HangupCause, Party, QueueLinkage, SessionEvent};
    use chrono::{Duration, Utc};

    fn queued_call(id: &str, queue: &str, wait: Option<i64>) -> CallSession {
        let t0 = Utc::now();
        let mut s = CallSession::new(id, Direction::Inbound, Party::number("+1555"), Party::number("+4930"), t0);
        let mut link = QueueLinkage::new(queue, t0);
        s.apply(SessionEvent::Ring, t0).unwrap();
        if let Some(wait) = wait {
            s.apply(SessionEvent::Answer, t0 + Duration::seconds(wait)).unwrap();
            link.wait_secs = Some(wait as f64);
        }
        s.apply(SessionEvent::End(HangupCause::NormalClearing), t0 + Duration::seconds(90))
            .unwrap();
        s.queue = Some(link);
        s
    }

    #[test]
    fn test_service_level_ratio() {
        let mut queue = QueueDefinition::new("q1", QueueStrategy::LongestIdle);
        queue.service_level_threshold_secs = 20;
        queue.service_level_goal_percent = 80;

        let calls = vec![
            queued_call("a", "q1", Some(5)),
            queued_call("b", "q1", Some(20)),
            queued_call("c", "q1", Some(45)),
            queued_call("d", "q1", None),
            queued_call("e", "q2", Some(1)),
        ];
        let level = ServiceLevel::compute(&queue, &calls);

        assert_eq!(level.answered, 3);
        assert_eq!(level.within_threshold, 2);
        assert!((level.ratio.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!(!level.meets_goal());
    }

    #[test]
    fn test_service_level_without_answers() {
        let queue = QueueDefinition::new("q1", QueueStrategy::LongestIdle);
        let level = ServiceLevel::compute(&queue, &[]);
        assert_eq!(level.ratio, None);
        assert!(level.meets_goal());
    }
}
