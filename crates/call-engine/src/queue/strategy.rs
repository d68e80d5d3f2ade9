//! Agent selection strategies
//!
//! Every strategy is a pure function over the already-filtered eligible set,
//! except round robin, which also takes the queue's cursor (the key of the
//! member chosen last).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::entities::{AgentStatus, QueueDefinition, QueueMember};

/// A queue member together with the inputs selection needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCandidate {
    pub extension_id: String,
    pub priority: i32,
    pub penalty: u32,
    pub skills: Vec<String>,
    pub status: AgentStatus,
    /// When the agent's current status was entered
    pub state_changed_at: DateTime<Utc>,
    pub talk_time_secs: u64,
}

impl AgentCandidate {
    pub fn from_member(
        member: &QueueMember,
        status: AgentStatus,
        state_changed_at: DateTime<Utc>,
        talk_time_secs: u64,
    ) -> Self {
        Self {
            extension_id: member.extension_id.clone(),
            priority: member.priority,
            penalty: member.penalty,
            skills: member.skills.clone(),
            status,
            state_changed_at,
            talk_time_secs,
        }
    }

    /// Round-robin ordering key
    pub fn order_key(&self) -> (i32, &str) {
        (self.priority, self.extension_id.as_str())
    }

    /// Available, carrying the required skill, and within the penalty cap
    pub fn is_eligible(&self, queue: &QueueDefinition, required_skill: Option<&str>) -> bool {
        if self.status != AgentStatus::Available {
            return false;
        }
        if let Some(skill) = required_skill {
            if !self.skills.iter().any(|s| s == skill) {
                return false;
            }
        }
        match queue.max_member_penalty {
            Some(max) => self.penalty <= max,
            None => true,
        }
    }
}

/// Oldest `available` timestamp first; ties go to the lowest extension id
fn idle_order(a: &AgentCandidate, b: &AgentCandidate) -> Ordering {
    a.state_changed_at
        .cmp(&b.state_changed_at)
        .then_with(|| a.extension_id.cmp(&b.extension_id))
}

pub fn longest_idle(candidates: &[AgentCandidate]) -> Option<&AgentCandidate> {
    candidates.iter().min_by(|a, b| idle_order(a, b))
}

/// Lowest talk time; ties go to the longest idle
pub fn least_talk_time(candidates: &[AgentCandidate]) -> Option<&AgentCandidate> {
    candidates.iter().min_by(|a, b| {
        a.talk_time_secs
            .cmp(&b.talk_time_secs)
            .then_with(|| idle_order(a, b))
    })
}

/// Next member after `cursor` in (priority, id) order, wrapping to the start
pub fn round_robin<'a>(
    candidates: &'a [AgentCandidate],
    cursor: Option<&(i32, String)>,
) -> Option<&'a AgentCandidate> {
    let mut ordered: Vec<&AgentCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let after_cursor = cursor.and_then(|(prio, id)| {
        ordered
            .iter()
            .copied()
            .find(|c| c.order_key() > (*prio, id.as_str()))
    });
    after_cursor.or_else(|| ordered.first().copied())
}

pub fn random<'a, R: Rng + ?Sized>(candidates: &'a [AgentCandidate], rng: &mut R) -> Option<&'a AgentCandidate> {
    if candidates.is_empty() {
        return None;
    }
    let mut ordered: Vec<&AgentCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    Some(ordered[rng.gen_range(0..ordered.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cand(id: &str, priority: i32, idle_since: DateTime<Utc>, talk: u64) -> AgentCandidate {
        AgentCandidate {
            extension_id: id.to_string(),
            priority,
            penalty: 0,
            skills: vec![],
            status: AgentStatus::Available,
            state_changed_at: idle_since,
            talk_time_secs: talk,
        }
    }

    #[test]
    fn test_longest_idle_picks_oldest() {
        let t1 = Utc::now();
        let agents = vec![
            cand("c", 0, t1 + Duration::seconds(20), 0),
            cand("a", 0, t1, 0),
            cand("b", 0, t1 + Duration::seconds(10), 0),
        ];
        assert_eq!(longest_idle(&agents).unwrap().extension_id, "a");
    }

    #[test]
    fn test_longest_idle_tie_breaks_on_lowest_id() {
        let t = Utc::now();
        let agents = vec![cand("e300", 0, t, 0), cand("e100", 0, t, 0), cand("e200", 0, t, 0)];
        assert_eq!(longest_idle(&agents).unwrap().extension_id, "e100");
    }

    #[test]
    fn test_least_talk_time_tie_breaks_on_idle() {
        let t = Utc::now();
        let agents = vec![
            cand("a", 0, t, 300),
            cand("b", 0, t + Duration::seconds(5), 60),
            cand("c", 0, t, 60),
        ];
        assert_eq!(least_talk_time(&agents).unwrap().extension_id, "c");
    }

    #[test]
    fn test_round_robin_rotates_and_wraps() {
        let t = Utc::now();
        let agents = vec![cand("B", 0, t, 0), cand("C", 0, t, 0), cand("A", 0, t, 0)];
        let mut cursor: Option<(i32, String)> = None;
        let mut picked = Vec::new();
        for _ in 0..4 {
            let chosen = round_robin(&agents, cursor.as_ref()).unwrap();
            cursor = Some((chosen.priority, chosen.extension_id.clone()));
            picked.push(chosen.extension_id.clone());
        }
        assert_eq!(picked, vec!["A", "B", "C", "A"]);
    }

    #[test]
    fn test_round_robin_orders_by_priority_first() {
        let t = Utc::now();
        let agents = vec![cand("a", 2, t, 0), cand("z", 1, t, 0)];
        assert_eq!(round_robin(&agents, None).unwrap().extension_id, "z");
        let cursor = (1, "z".to_string());
        assert_eq!(round_robin(&agents, Some(&cursor)).unwrap().extension_id, "a");
    }

    #[test]
    fn test_round_robin_skips_departed_cursor_member() {
        let t = Utc::now();
        let agents = vec![cand("A", 0, t, 0), cand("C", 0, t, 0)];
        // B was chosen last but is no longer eligible
        let cursor = (0, "B".to_string());
        assert_eq!(round_robin(&agents, Some(&cursor)).unwrap().extension_id, "C");
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let t = Utc::now();
        let agents = vec![cand("a", 0, t, 0), cand("b", 0, t, 0), cand("c", 0, t, 0)];
        let picks = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..8)
                .map(|_| random(&agents, &mut rng).unwrap().extension_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
        assert!(random(&[], &mut StdRng::seed_from_u64(1)).is_none());
    }

    #[test]
    fn test_eligibility_filters() {
        let mut queue = QueueDefinition::new("q", crate::entities::QueueStrategy::RingAll);
        queue.max_member_penalty = Some(2);
        let t = Utc::now();

        let mut skilled = cand("a", 0, t, 0);
        skilled.skills = vec!["german".to_string()];
        assert!(skilled.is_eligible(&queue, Some("german")));
        assert!(!skilled.is_eligible(&queue, Some("french")));

        let mut heavy = cand("b", 0, t, 0);
        heavy.penalty = 3;
        assert!(!heavy.is_eligible(&queue, None));

        let mut on_break = cand("c", 0, t, 0);
        on_break.status = AgentStatus::Break;
        assert!(!on_break.is_eligible(&queue, None));
    }
}
