//! Concurrent-call accounting per trunk

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::entities::Trunk;

/// Live call counts for every trunk
#[derive(Debug, Default, Clone)]
pub struct TrunkUsage {
    counts: Arc<DashMap<String, Arc<AtomicU32>>>,
}

impl TrunkUsage {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, trunk_id: &str) -> Arc<AtomicU32> {
        self.counts
            .entry(trunk_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone()
    }

    /// Reserve one call slot, or `None` when the trunk is at its maximum.
    ///
    /// The check and the increment are a single CAS loop, so two calls racing
    /// for the last slot cannot both win.
    pub fn try_acquire(&self, trunk: &Trunk) -> Option<TrunkLease> {
        let counter = self.counter(&trunk.id);
        let acquired = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < trunk.max_concurrent_calls).then_some(current + 1)
            })
            .is_ok();

        if acquired {
            debug!("Trunk {} slot acquired", trunk.id);
            Some(TrunkLease {
                trunk_id: trunk.id.clone(),
                counter,
            })
        } else {
            None
        }
    }

    pub fn in_use(&self, trunk_id: &str) -> u32 {
        self.counts
            .get(trunk_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// One reserved call slot on a trunk; released on drop
pub struct TrunkLease {
    trunk_id: String,
    counter: Arc<AtomicU32>,
}

impl TrunkLease {
    pub fn trunk_id(&self) -> &str {
        &self.trunk_id
    }
}

impl Drop for TrunkLease {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        debug!("Trunk {} slot released", self.trunk_id);
    }
}

impl fmt::Debug for TrunkLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrunkLease").field("trunk_id", &self.trunk_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_limits_and_release() {
        let usage = TrunkUsage::new();
        let mut trunk = Trunk::new("t1", "carrier.example");
        trunk.max_concurrent_calls = 2;

        let a = usage.try_acquire(&trunk).unwrap();
        let _b = usage.try_acquire(&trunk).unwrap();
        assert!(usage.try_acquire(&trunk).is_none());
        assert_eq!(usage.in_use("t1"), 2);

        drop(a);
        assert_eq!(usage.in_use("t1"), 1);
        assert!(usage.try_acquire(&trunk).is_some());
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        let usage = TrunkUsage::new();
        let mut trunk = Trunk::new("t1", "carrier.example");
        trunk.max_concurrent_calls = 5;

        let leases: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| usage.try_acquire(&trunk)))
                .collect();
            handles.into_iter().filter_map(|h| h.join().ok().flatten()).collect()
        });

        assert_eq!(leases.len(), 5);
        assert_eq!(usage.in_use("t1"), 5);
    }
}
